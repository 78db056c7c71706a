use crate::Error;

/// Command byte of the inter-process framing.
///
/// The discriminants are part of the wire contract between the supervisor,
/// the security module and the workers. The security module can outlive a
/// supervisor reload, so values are fixed forever: new commands get new
/// numbers, old numbers are never reused.
///
/// Commands 1..=12 flow between workers and the supervisor; 32 and up flow
/// between the supervisor and the security module.
#[derive(PartialEq, Eq, Hash, Debug, Clone, Copy)]
pub enum Command {
    AuthCookieReq,
    AuthCookieRep,
    ResumeStoreReq,
    ResumeDeleteReq,
    ResumeFetchReq,
    ResumeFetchRep,
    UdpFd,
    TunMtu,
    Terminate,
    SessionInfo,
    BanIp,
    BanIpReply,

    SecAuthInit,
    SecAuthCont,
    SecAuthReply,
    SecDecrypt,
    SecSign,
    SecCliStats,
    SecmSessionOpen,
    SecmSessionClose,
    SecmSessionReply,
    SecmStats,
    SecmBanIp,
    SecmBanIpReply,
    SecmReload,
    SecmReloadReply,
    SecmListCookies,
    SecmListCookiesReply,
}

impl TryFrom<u8> for Command {
    type Error = Error;

    /// # Test
    ///
    /// ```
    /// use vpn_server_codec::command::Command;
    ///
    /// assert_eq!(Command::try_from(1).unwrap(), Command::AuthCookieReq);
    /// assert_eq!(Command::try_from(2).unwrap(), Command::AuthCookieRep);
    /// assert_eq!(Command::try_from(9).unwrap(), Command::Terminate);
    /// assert_eq!(Command::try_from(32).unwrap(), Command::SecAuthInit);
    /// assert_eq!(Command::try_from(40).unwrap(), Command::SecmSessionReply);
    /// assert!(Command::try_from(0).is_err());
    /// assert!(Command::try_from(200).is_err());
    /// ```
    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Ok(match value {
            1 => Self::AuthCookieReq,
            2 => Self::AuthCookieRep,
            3 => Self::ResumeStoreReq,
            4 => Self::ResumeDeleteReq,
            5 => Self::ResumeFetchReq,
            6 => Self::ResumeFetchRep,
            7 => Self::UdpFd,
            8 => Self::TunMtu,
            9 => Self::Terminate,
            10 => Self::SessionInfo,
            11 => Self::BanIp,
            12 => Self::BanIpReply,
            32 => Self::SecAuthInit,
            33 => Self::SecAuthCont,
            34 => Self::SecAuthReply,
            35 => Self::SecDecrypt,
            36 => Self::SecSign,
            37 => Self::SecCliStats,
            38 => Self::SecmSessionOpen,
            39 => Self::SecmSessionClose,
            40 => Self::SecmSessionReply,
            41 => Self::SecmStats,
            42 => Self::SecmBanIp,
            43 => Self::SecmBanIpReply,
            44 => Self::SecmReload,
            45 => Self::SecmReloadReply,
            46 => Self::SecmListCookies,
            47 => Self::SecmListCookiesReply,
            _ => return Err(Error::UnknownCommand(value)),
        })
    }
}

impl From<Command> for u8 {
    /// # Test
    ///
    /// ```
    /// use vpn_server_codec::command::Command;
    ///
    /// assert_eq!(u8::from(Command::AuthCookieReq), 1);
    /// assert_eq!(u8::from(Command::BanIpReply), 12);
    /// assert_eq!(u8::from(Command::SecAuthInit), 32);
    /// assert_eq!(u8::from(Command::SecmListCookiesReply), 47);
    /// ```
    fn from(value: Command) -> u8 {
        match value {
            Command::AuthCookieReq => 1,
            Command::AuthCookieRep => 2,
            Command::ResumeStoreReq => 3,
            Command::ResumeDeleteReq => 4,
            Command::ResumeFetchReq => 5,
            Command::ResumeFetchRep => 6,
            Command::UdpFd => 7,
            Command::TunMtu => 8,
            Command::Terminate => 9,
            Command::SessionInfo => 10,
            Command::BanIp => 11,
            Command::BanIpReply => 12,
            Command::SecAuthInit => 32,
            Command::SecAuthCont => 33,
            Command::SecAuthReply => 34,
            Command::SecDecrypt => 35,
            Command::SecSign => 36,
            Command::SecCliStats => 37,
            Command::SecmSessionOpen => 38,
            Command::SecmSessionClose => 39,
            Command::SecmSessionReply => 40,
            Command::SecmStats => 41,
            Command::SecmBanIp => 42,
            Command::SecmBanIpReply => 43,
            Command::SecmReload => 44,
            Command::SecmReloadReply => 45,
            Command::SecmListCookies => 46,
            Command::SecmListCookiesReply => 47,
        }
    }
}

impl std::fmt::Display for Command {
    /// # Test
    ///
    /// ```
    /// use vpn_server_codec::command::Command;
    ///
    /// assert_eq!(Command::AuthCookieReq.to_string(), "auth cookie request");
    /// assert_eq!(Command::SecmReload.to_string(), "sm: reload");
    /// ```
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::AuthCookieReq => "auth cookie request",
            Self::AuthCookieRep => "auth cookie reply",
            Self::ResumeStoreReq => "resume data store request",
            Self::ResumeDeleteReq => "resume data delete request",
            Self::ResumeFetchReq => "resume data fetch request",
            Self::ResumeFetchRep => "resume data fetch reply",
            Self::UdpFd => "udp fd",
            Self::TunMtu => "tun mtu change",
            Self::Terminate => "terminate",
            Self::SessionInfo => "session info",
            Self::BanIp => "ban IP",
            Self::BanIpReply => "ban IP reply",
            Self::SecAuthInit => "sm: auth init",
            Self::SecAuthCont => "sm: auth cont",
            Self::SecAuthReply => "sm: auth rep",
            Self::SecDecrypt => "sm: decrypt",
            Self::SecSign => "sm: sign",
            Self::SecCliStats => "sm: worker cli stats",
            Self::SecmSessionOpen => "sm: session open",
            Self::SecmSessionClose => "sm: session close",
            Self::SecmSessionReply => "sm: session reply",
            Self::SecmStats => "sm: stats",
            Self::SecmBanIp => "sm: ban IP",
            Self::SecmBanIpReply => "sm: ban IP reply",
            Self::SecmReload => "sm: reload",
            Self::SecmReloadReply => "sm: reload reply",
            Self::SecmListCookies => "sm: list cookies",
            Self::SecmListCookiesReply => "sm: list cookies reply",
        })
    }
}
