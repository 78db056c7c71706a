pub mod config;
pub mod ipc;
pub mod observer;
pub mod proc;
pub mod resume;
pub mod secmod;
pub mod server;
pub mod statistics;
pub mod tun;
pub mod worker;

use std::{
    io,
    os::unix::net::UnixStream,
    sync::Arc,
    time::{SystemTime, UNIX_EPOCH},
};

use anyhow::Result;

use self::{
    config::Config,
    observer::Observer,
    secmod::{SecMod, StaticAuth},
    statistics::Statistics,
};

#[rustfmt::skip]
static SOFTWARE: &str = concat!(
    "vpn-server.",
    env!("CARGO_PKG_VERSION")
);

/// Seconds since the epoch. Time flows into the state cores explicitly;
/// this is the single place the processes read the clock.
pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs())
        .unwrap_or(0)
}

/// Bring up the process fleet: fork the privileged security module, then
/// run the supervisor in this process. The two share nothing but a
/// socket pair; a supervisor exit takes the module down with it via
/// end-of-stream.
pub fn startup(config: Arc<Config>) -> Result<()> {
    let (main_sock, secmod_sock) = UnixStream::pair()?;

    match unsafe { libc::fork() } {
        -1 => Err(io::Error::last_os_error().into()),
        0 => {
            drop(main_sock);

            let statistics = Statistics::default();
            let secmod = SecMod::new(
                config.clone(),
                StaticAuth::new(&config),
                Observer::new(statistics),
            );

            let code = match secmod.run(secmod_sock) {
                Ok(()) => 0,
                Err(error) => {
                    log::error!("sec-mod: {}", error);
                    1
                }
            };

            std::process::exit(code);
        }
        pid => {
            drop(secmod_sock);
            log::info!("{} started, security module pid {}", SOFTWARE, pid);

            let result = server::run(config, main_sock, Statistics::default());

            unsafe {
                libc::waitpid(pid, std::ptr::null_mut(), 0);
            }

            result
        }
    }
}
