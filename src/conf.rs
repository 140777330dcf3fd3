//! Configuration surface for the Fusion core.
//!
//! The configuration is plain data, owned by the caller and handed to
//! [`World::enter`](crate::world::World::enter). There is no global config
//! singleton: every component reads the copy held by its world.

use std::path::PathBuf;
use std::time::Duration;

/// What a forked child process should do with its inherited world state.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ForkAction {
    /// The child detaches from the world and must not use it.
    #[default]
    Stop,
    /// The child re-enters the world under a fresh fusion id.
    Restart,
}

/// Configuration for a fusion world.
///
/// All fields have working defaults; construct with `FusionConfig::default()`
/// and override what the deployment needs.
#[derive(Clone, Debug)]
pub struct FusionConfig {
    /// Pin shared-memory files to this directory instead of probing for the
    /// largest writable tmpfs-class mount.
    pub tmpfs: Option<PathBuf>,

    /// Base directory for the per-world socket directories. Defaults to
    /// `/tmp`.
    pub socket_dir: Option<PathBuf>,

    /// Size of the world's main shared memory pool.
    pub main_pool_size: usize,

    /// Group ownership applied to shared-memory files and socket
    /// directories. `None` leaves the process default.
    pub shmfile_gid: Option<u32>,

    /// Never become master, even if the master slot is free.
    pub force_slave: bool,

    /// Register fork handlers so a forking fusionee can hand its world state
    /// to the child according to [`ForkAction`].
    pub fork_handler: bool,

    /// Track every shared allocation with a descriptor so leaks can be
    /// dumped at pool destruction.
    pub debug_shm: bool,

    /// Secure fusion: slaves map shared pools read-only and all mutation is
    /// routed through calls validated by the master.
    pub secure_fusion: bool,

    /// Run object destructors on a dedicated thread instead of the dispatch
    /// thread.
    pub defer_destructors: bool,

    /// When non-zero, log reference up/down traffic for the ref with this
    /// id.
    pub trace_ref: u32,

    /// Maximum outstanding calls per caller before admission control kicks
    /// in with `LimitExceeded`.
    pub call_max_num: u32,

    /// Maximum call/reactor payload size in bytes.
    pub call_max_data: u32,

    /// How long a blocking call waits for its reply.
    pub call_timeout: Duration,

    /// Dump surviving objects ("zombies") when an object pool is destroyed
    /// with holders remaining.
    pub shutdown_info: bool,

    /// Raise `SIGTRAP` on detected invariant violations instead of
    /// returning `Error::Bug` to the caller.
    pub trap_on_bug: bool,
}

impl Default for FusionConfig {
    fn default() -> Self {
        Self {
            tmpfs: None,
            socket_dir: None,
            main_pool_size: 16 * 1024 * 1024,
            shmfile_gid: None,
            force_slave: false,
            fork_handler: false,
            debug_shm: false,
            secure_fusion: false,
            defer_destructors: false,
            trace_ref: 0,
            call_max_num: 512,
            call_max_data: 16 * 1024,
            call_timeout: Duration::from_secs(5),
            shutdown_info: false,
            trap_on_bug: false,
        }
    }
}

impl FusionConfig {
    /// Set a single option by name, mirroring command-line / config-file
    /// syntax (`"tmpfs"`, `"force-slave"`, `"call-max-num"`, ...).
    ///
    /// Unknown names fail with `InvalidArg` so typos surface instead of
    /// being silently ignored.
    pub fn set(&mut self, name: &str, value: &str) -> crate::Result<()> {
        match name {
            "tmpfs" => self.tmpfs = Some(PathBuf::from(value)),
            "shmfile-gid" => {
                self.shmfile_gid =
                    Some(value.parse().map_err(|_| {
                        crate::Error::InvalidArg("shmfile-gid expects a numeric gid")
                    })?)
            }
            "force-slave" => self.force_slave = parse_bool(value)?,
            "fork-handler" => self.fork_handler = parse_bool(value)?,
            "debug-shm" => self.debug_shm = parse_bool(value)?,
            "secure-fusion" => self.secure_fusion = parse_bool(value)?,
            "defer-destructors" => self.defer_destructors = parse_bool(value)?,
            "trace-ref" => {
                self.trace_ref = value
                    .parse()
                    .map_err(|_| crate::Error::InvalidArg("trace-ref expects a ref id"))?
            }
            "call-max-num" => {
                self.call_max_num = value
                    .parse()
                    .map_err(|_| crate::Error::InvalidArg("call-max-num expects a count"))?
            }
            "call-max-data" => {
                self.call_max_data = value
                    .parse()
                    .map_err(|_| crate::Error::InvalidArg("call-max-data expects bytes"))?
            }
            "call-timeout-ms" => {
                self.call_timeout = Duration::from_millis(
                    value
                        .parse()
                        .map_err(|_| crate::Error::InvalidArg("call-timeout-ms expects millis"))?,
                )
            }
            "shutdown-info" => self.shutdown_info = parse_bool(value)?,
            "trap-on-bug" => self.trap_on_bug = parse_bool(value)?,
            _ => return Err(crate::Error::InvalidArg("unknown configuration option")),
        }
        Ok(())
    }
}

fn parse_bool(value: &str) -> crate::Result<bool> {
    match value {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(crate::Error::InvalidArg("expected a boolean")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let conf = FusionConfig::default();
        assert!(!conf.secure_fusion);
        assert_eq!(conf.call_max_num, 512);
        assert_eq!(conf.call_timeout, Duration::from_secs(5));
    }

    #[test]
    fn test_set_by_name() {
        let mut conf = FusionConfig::default();
        conf.set("tmpfs", "/run/fusion").unwrap();
        conf.set("secure-fusion", "yes").unwrap();
        conf.set("call-max-num", "64").unwrap();
        conf.set("call-timeout-ms", "250").unwrap();

        assert_eq!(conf.tmpfs.as_deref(), Some(std::path::Path::new("/run/fusion")));
        assert!(conf.secure_fusion);
        assert_eq!(conf.call_max_num, 64);
        assert_eq!(conf.call_timeout, Duration::from_millis(250));
    }

    #[test]
    fn test_set_unknown_option_fails() {
        let mut conf = FusionConfig::default();
        assert!(conf.set("no-such-option", "1").is_err());
        assert!(conf.set("force-slave", "maybe").is_err());
    }
}
