use std::{
    collections::HashMap,
    fs::read_to_string,
    net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr},
    path::PathBuf,
    str::FromStr,
    sync::Arc,
};

use anyhow::{Result, anyhow};
use clap::Parser;
use serde::Deserialize;

use service::{ban::BanConfig, ip_util::ipv4_route_to_cidr, session::VhostParams};

/// Name of the vhost used when a client does not select one.
pub const DEFAULT_VHOST: &str = "default";

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
pub struct Server {
    ///
    /// tun device name prefix
    ///
    /// Devices are created from this template, e.g. "vpns" produces
    /// vpns0, vpns1, ...
    ///
    #[serde(default = "Server::device")]
    pub device: String,
    ///
    /// owner of created tun devices
    ///
    /// When set, created devices are chowned to this uid so the
    /// unprivileged workers can keep using them.
    ///
    #[serde(default)]
    pub uid: Option<u32>,
    #[serde(default)]
    pub gid: Option<u32>,
    ///
    /// listen addresses
    ///
    /// The TCP addresses the supervisor accepts client tunnels on. An
    /// empty list starts the process fleet without any client surface.
    ///
    #[serde(default)]
    pub listen: Vec<SocketAddr>,
}

impl Server {
    fn device() -> String {
        "vpns".to_string()
    }
}

impl Default for Server {
    fn default() -> Self {
        Self {
            device: Self::device(),
            uid: None,
            gid: None,
            listen: Default::default(),
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
pub struct Network {
    ///
    /// IPv4 pool, network/prefix or network/netmask
    ///
    /// Addresses for the point-to-point links are leased from this pool.
    ///
    #[serde(default = "Network::ipv4_network")]
    pub ipv4_network: Option<String>,
    ///
    /// IPv6 pool, network/prefix
    ///
    #[serde(default)]
    pub ipv6_network: Option<String>,
    ///
    /// DNS servers pushed to clients
    ///
    /// Addresses listed here are excluded from the lease pools.
    ///
    #[serde(default)]
    pub dns: Vec<IpAddr>,
    #[serde(default = "Network::mtu")]
    pub mtu: u16,
}

impl Network {
    fn ipv4_network() -> Option<String> {
        Some("10.200.0.0/24".to_string())
    }

    fn mtu() -> u16 {
        1500
    }

    pub fn ipv4(&self) -> Result<Option<(Ipv4Addr, u8)>> {
        match &self.ipv4_network {
            // Both `10.0.0.0/24` and the netmask form `10.0.0.0/255.255.255.0`
            // are accepted; normalize to prefix form before splitting.
            Some(it) => {
                let cidr = ipv4_route_to_cidr(it)
                    .ok_or_else(|| anyhow!("bad ipv4 network: {}", it))?;
                parse_network(&cidr).map(Some)
            }
            None => Ok(None),
        }
    }

    pub fn ipv6(&self) -> Result<Option<(Ipv6Addr, u8)>> {
        match &self.ipv6_network {
            Some(it) => parse_network(it).map(Some),
            None => Ok(None),
        }
    }
}

impl Default for Network {
    fn default() -> Self {
        Self {
            ipv4_network: Self::ipv4_network(),
            ipv6_network: None,
            dns: Default::default(),
            mtu: Self::mtu(),
        }
    }
}

fn parse_network<T: FromStr>(value: &str) -> Result<(T, u8)> {
    let (network, prefix) = value
        .split_once('/')
        .ok_or_else(|| anyhow!("network without a prefix: {}", value))?;

    Ok((
        network
            .parse()
            .map_err(|_| anyhow!("bad network address: {}", network))?,
        prefix.parse()?,
    ))
}

#[derive(Deserialize, Debug, Default, Clone)]
#[serde(rename_all = "kebab-case")]
pub struct Auth {
    ///
    /// static user password
    ///
    /// This option can be used to specify the static identity
    /// authentication information used by the server for verification.
    ///
    #[serde(default)]
    pub static_credentials: HashMap<String, String>,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
pub struct Ban {
    ///
    /// Score at which an address is banned. Zero disables banning.
    ///
    #[serde(default = "Ban::max_ban_score")]
    pub max_ban_score: u32,
    ///
    /// Seconds after which an untouched score resets to zero.
    ///
    #[serde(default = "Ban::ban_reset_time")]
    pub ban_reset_time: u64,
    ///
    /// Seconds a ban lasts once imposed.
    ///
    #[serde(default = "Ban::min_reauth_time")]
    pub min_reauth_time: u64,
    #[serde(default = "Ban::ban_points_connect")]
    pub ban_points_connect: u32,
    #[serde(default = "Ban::ban_points_wrong_password")]
    pub ban_points_wrong_password: u32,
}

impl Ban {
    fn max_ban_score() -> u32 {
        80
    }

    fn ban_reset_time() -> u64 {
        1200
    }

    fn min_reauth_time() -> u64 {
        300
    }

    fn ban_points_connect() -> u32 {
        1
    }

    fn ban_points_wrong_password() -> u32 {
        10
    }

    pub fn as_ban_config(&self) -> BanConfig {
        BanConfig {
            max_ban_score: self.max_ban_score,
            ban_reset_time: self.ban_reset_time,
            min_reauth_time: self.min_reauth_time,
            ban_points_connect: self.ban_points_connect,
            ban_points_wrong_password: self.ban_points_wrong_password,
        }
    }
}

impl Default for Ban {
    fn default() -> Self {
        Self {
            max_ban_score: Self::max_ban_score(),
            ban_reset_time: Self::ban_reset_time(),
            min_reauth_time: Self::min_reauth_time(),
            ban_points_connect: Self::ban_points_connect(),
            ban_points_wrong_password: Self::ban_points_wrong_password(),
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
pub struct Timeouts {
    ///
    /// Seconds a dormant session stays resumable.
    ///
    #[serde(default = "Timeouts::cookie_timeout")]
    pub cookie_timeout: u64,
    ///
    /// Deadline for one command round trip between processes.
    ///
    #[serde(default = "Timeouts::secmod")]
    pub secmod: u64,
    ///
    /// Seconds a cached TLS resume ticket stays valid.
    ///
    #[serde(default = "Timeouts::resume")]
    pub resume: u64,
}

impl Timeouts {
    fn cookie_timeout() -> u64 {
        300
    }

    fn secmod() -> u64 {
        10
    }

    fn resume() -> u64 {
        3600
    }
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            cookie_timeout: Self::cookie_timeout(),
            secmod: Self::secmod(),
            resume: Self::resume(),
        }
    }
}

#[derive(Deserialize, Debug, Clone, Copy)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl Default for LogLevel {
    fn default() -> Self {
        Self::Info
    }
}

impl LogLevel {
    pub fn as_level(&self) -> log::Level {
        match *self {
            Self::Error => log::Level::Error,
            Self::Debug => log::Level::Debug,
            Self::Trace => log::Level::Trace,
            Self::Warn => log::Level::Warn,
            Self::Info => log::Level::Info,
        }
    }
}

#[derive(Deserialize, Debug, Default, Clone)]
#[serde(rename_all = "kebab-case")]
pub struct Log {
    ///
    /// log level
    ///
    /// An enum representing the available verbosity levels of the logger.
    ///
    #[serde(default)]
    pub level: LogLevel,
}

/// Per-virtual-host overrides. Anything unset falls back to the global
/// sections.
#[derive(Deserialize, Debug, Default, Clone)]
#[serde(rename_all = "kebab-case")]
pub struct Vhost {
    #[serde(default)]
    pub cookie_timeout: Option<u64>,
    ///
    /// Keep sessions resumable across server-initiated disconnects.
    ///
    #[serde(default)]
    pub persistent_cookies: bool,
    ///
    /// Message of the day, copied into each session reply.
    ///
    #[serde(default)]
    pub motd: Option<String>,
    ///
    /// Static IPv4 assignment per username. Conflicts fall back to the
    /// pool with a warning.
    ///
    #[serde(default)]
    pub static_ipv4: HashMap<String, Ipv4Addr>,
}

#[derive(Deserialize, Debug, Default, Clone)]
#[serde(rename_all = "kebab-case")]
pub struct Config {
    #[serde(default)]
    pub server: Server,
    #[serde(default)]
    pub network: Network,
    #[serde(default)]
    pub auth: Auth,
    #[serde(default)]
    pub ban: Ban,
    #[serde(default)]
    pub timeouts: Timeouts,
    #[serde(default)]
    pub log: Log,
    #[serde(default)]
    pub vhost: HashMap<String, Vhost>,
    /// The file this config was loaded from; reload re-reads it.
    #[serde(skip)]
    pub source: Option<PathBuf>,
}

#[derive(Parser, Debug)]
#[command(
    about = env!("CARGO_PKG_DESCRIPTION"),
    version = env!("CARGO_PKG_VERSION"),
    author = env!("CARGO_PKG_AUTHORS"),
)]
struct Cli {
    ///
    /// Specify the configuration file path
    ///
    /// Example: vpn-server --config /etc/vpn-server/config.toml
    ///
    #[arg(long, short)]
    config: String,
}

impl Config {
    ///
    /// Load configure from config file and command line parameters.
    ///
    pub fn load() -> Result<Self> {
        let path = PathBuf::from(Cli::parse().config);
        let mut config = toml::from_str::<Self>(&read_to_string(&path)?)?;
        config.validate()?;
        config.source = Some(path);
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        self.network.ipv4()?;
        self.network.ipv6()?;

        if self.network.ipv4_network.is_none() && self.network.ipv6_network.is_none() {
            return Err(anyhow!("no address pool configured"));
        }

        Ok(())
    }

    /// The session parameters of a vhost, with global fallbacks applied.
    pub fn vhost_params(&self, name: &str) -> Arc<VhostParams> {
        let vhost = self.vhost.get(name);

        Arc::new(VhostParams {
            name: name.to_string(),
            cookie_timeout: vhost
                .and_then(|it| it.cookie_timeout)
                .unwrap_or(self.timeouts.cookie_timeout),
            persistent_cookies: vhost.map(|it| it.persistent_cookies).unwrap_or(false),
            motd: vhost.and_then(|it| it.motd.clone()),
        })
    }

    /// Static IPv4 assignment of a user under a vhost, when configured.
    pub fn static_ipv4(&self, vhost: &str, username: &str) -> Option<Ipv4Addr> {
        self.vhost.get(vhost)?.static_ipv4.get(username).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_usable() {
        let config = toml::from_str::<Config>("").unwrap();

        assert_eq!(config.server.device, "vpns");
        assert_eq!(config.network.mtu, 1500);
        assert_eq!(config.ban.max_ban_score, 80);
        assert_eq!(config.timeouts.cookie_timeout, 300);
        assert!(config.validate().is_ok());

        let (network, prefix) = config.network.ipv4().unwrap().unwrap();
        assert_eq!(network.to_string(), "10.200.0.0");
        assert_eq!(prefix, 24);
    }

    #[test]
    fn vhost_overrides_apply() {
        let config = toml::from_str::<Config>(
            r#"
            [vhost.corp]
            cookie-timeout = 600
            persistent-cookies = true
            motd = "welcome"

            [vhost.corp.static-ipv4]
            alice = "10.200.0.77"
            "#,
        )
        .unwrap();

        let params = config.vhost_params("corp");
        assert_eq!(params.cookie_timeout, 600);
        assert!(params.persistent_cookies);
        assert_eq!(params.motd.as_deref(), Some("welcome"));

        assert_eq!(
            config.static_ipv4("corp", "alice").unwrap().to_string(),
            "10.200.0.77"
        );
        assert!(config.static_ipv4("corp", "bob").is_none());

        // Unknown vhosts fall back to the global timers.
        let params = config.vhost_params(DEFAULT_VHOST);
        assert_eq!(params.cookie_timeout, 300);
        assert!(!params.persistent_cookies);
    }

    #[test]
    fn netmask_form_networks_are_accepted() {
        let config = toml::from_str::<Config>(
            r#"
            [network]
            ipv4-network = "10.0.0.0/255.255.255.0"
            "#,
        )
        .unwrap();

        assert!(config.validate().is_ok());

        let (network, prefix) = config.network.ipv4().unwrap().unwrap();
        assert_eq!(network.to_string(), "10.0.0.0");
        assert_eq!(prefix, 24);
    }

    #[test]
    fn bad_network_is_rejected() {
        let config = toml::from_str::<Config>(
            r#"
            [network]
            ipv4-network = "10.0.0.0"
            "#,
        )
        .unwrap();

        assert!(config.validate().is_err());
    }
}
