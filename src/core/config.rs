//! # Router configuration.
//!
//! Provides [`RouterConfig`] and the per-runner sections it nests:
//! [`SimulationConfig`], [`LocalConfig`] and [`RemoteConfig`].
//!
//! Config is used in two ways:
//! 1. **Router creation**: `Router::builder(config).build()`
//! 2. **Runner creation**: each runner receives its own section on every board change
//!
//! ## Sentinel values
//! - `timeout = 0s` → no timeout (treated as `None` by the accessors)
//! - `LocalConfig::pattern_kill = None` → only the spawned process group is signalled
//! - `RemoteConfig::bootstrap_password = None` → bootstrap commands run without `sshpass`
//! - `RouterConfig::network_bring_up = None` → no bring-up, the remote runner is always created

use std::path::PathBuf;
use std::time::Duration;

use tokio::process::Command;

/// Program plus arguments of an external command.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CommandSpec {
    /// Program to execute (looked up in `PATH`).
    pub program: String,
    /// Arguments.
    pub args: Vec<String>,
}

impl CommandSpec {
    /// Creates a spec from a program and its arguments.
    pub fn new<I, S>(program: impl Into<String>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
        }
    }

    /// Builds a ready-to-spawn command.
    pub fn command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args);
        cmd
    }
}

fn home_dir() -> PathBuf {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(std::env::temp_dir)
}

#[inline]
fn non_zero(d: Duration) -> Option<Duration> {
    if d == Duration::ZERO { None } else { Some(d) }
}

/// Global configuration of the router.
///
/// ## Field semantics
/// - `work_dir`: where the combined script is written before every run
/// - `script_name`: file name of the combined script (also used for remote pattern kills)
/// - `bus_capacity`: event bus ring buffer size (min 1; clamped by Bus)
/// - `network_bring_up`: command run on every board change when remote execution is enabled
/// - `grace`: shutdown waits at most this long for runners to report their last outcome
#[derive(Clone, Debug)]
pub struct RouterConfig {
    /// Directory holding the staged script.
    pub work_dir: PathBuf,

    /// File name of the staged script.
    pub script_name: String,

    /// Capacity of the event bus broadcast channel ring buffer.
    ///
    /// The router's own listener is the only receiver; if it lags more than
    /// `bus_capacity` events it skips the oldest ones.
    pub bus_capacity: usize,

    /// Network bring-up for the remote kit.
    ///
    /// A non-zero exit disables only the remote runner for the selected board.
    pub network_bring_up: Option<CommandSpec>,

    /// Upper bound for the network bring-up command.
    pub bring_up_timeout: Duration,

    /// How long shutdown waits for runners to settle after killing them.
    pub grace: Duration,

    /// Simulation runner settings.
    pub simulation: SimulationConfig,

    /// Local runner settings.
    pub local: LocalConfig,

    /// Remote runner settings.
    pub remote: RemoteConfig,
}

impl RouterConfig {
    /// Full path of the staged script.
    #[inline]
    pub fn script_path(&self) -> PathBuf {
        self.work_dir.join(&self.script_name)
    }

    /// Returns a bus capacity clamped to a minimum of 1.
    #[inline]
    pub fn bus_capacity_clamped(&self) -> usize {
        self.bus_capacity.max(1)
    }

    /// The bring-up command, if remote execution is enabled and one is configured.
    #[inline]
    pub fn bring_up(&self) -> Option<&CommandSpec> {
        if self.remote.enabled {
            self.network_bring_up.as_ref()
        } else {
            None
        }
    }
}

impl Default for RouterConfig {
    /// Default configuration:
    ///
    /// - `work_dir = $TMPDIR/make-light`
    /// - `script_name = "powerup-code-all.py"`
    /// - `bus_capacity = 1024`
    /// - `network_bring_up = sudo /usr/bin/powerup-network -u` (30s timeout)
    /// - `grace = 5s`
    /// - simulation and local enabled, remote disabled
    fn default() -> Self {
        Self {
            work_dir: std::env::temp_dir().join("make-light"),
            script_name: "powerup-code-all.py".to_string(),
            bus_capacity: 1024,
            network_bring_up: Some(CommandSpec::new(
                "sudo",
                ["/usr/bin/powerup-network", "-u"],
            )),
            bring_up_timeout: Duration::from_secs(30),
            grace: Duration::from_secs(5),
            simulation: SimulationConfig::default(),
            local: LocalConfig::default(),
            remote: RemoteConfig::default(),
        }
    }
}

/// Settings of the animation host process.
#[derive(Clone, Debug)]
pub struct SimulationConfig {
    /// Whether a simulation runner is created when a display socket is attached.
    pub enabled: bool,

    /// Host program and arguments (the `debug` flag is appended when `debug` is set).
    pub host: CommandSpec,

    /// Ask the host to log what it is doing.
    pub debug: bool,

    /// Named pipe carrying the error text of a failed script.
    ///
    /// Deleted and recreated every time a host process is started.
    pub pipe_path: PathBuf,

    /// Maximum number of buffered frames (oldest dropped once full).
    pub max_frames: usize,

    /// Time the host gets to exit after SIGTERM before SIGKILL.
    pub kill_grace: Duration,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            host: CommandSpec::new("python", ["/usr/share/make-light/animation_plug.py"]),
            debug: false,
            pipe_path: std::env::temp_dir()
                .join("make-light")
                .join("make-light-simulator.pipe"),
            max_frames: 150,
            kill_grace: Duration::from_secs(2),
        }
    }
}

/// Settings for running scripts on locally attached hardware.
#[derive(Clone, Debug)]
pub struct LocalConfig {
    /// Whether to run locally when the board is detected.
    pub enabled: bool,

    /// Interpreter the staged script is passed to.
    pub interpreter: String,

    /// `pkill` program used to sweep stray interpreters running the staged script.
    pub pattern_kill: Option<String>,

    /// Time the script gets to exit after SIGTERM before SIGKILL.
    pub kill_grace: Duration,
}

impl Default for LocalConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interpreter: "python".to_string(),
            pattern_kill: Some("pkill".to_string()),
            kill_grace: Duration::from_secs(2),
        }
    }
}

/// Settings for the remote kit reached over ssh.
#[derive(Clone, Debug)]
pub struct RemoteConfig {
    /// Whether remote execution is configured at all.
    pub enabled: bool,

    /// Kit hostname.
    pub host: String,
    /// Login user on the kit.
    pub user: String,

    /// `ping` program used by the heartbeat.
    pub ping: String,
    /// `ssh` program.
    pub ssh: String,
    /// `scp` program.
    pub scp: String,
    /// `ssh-keygen` program.
    pub keygen: String,
    /// `sshpass` program used for the password-authenticated bootstrap.
    pub sshpass: String,
    /// Factory password of the kit, used until the key is installed.
    pub bootstrap_password: Option<String>,

    /// Private key installed on the kit (`<key_file>.pub` is copied over).
    pub key_file: PathBuf,

    /// Options passed to every `ssh`/`scp` call.
    pub ssh_options: Vec<String>,

    /// Heartbeat period.
    pub heartbeat_interval: Duration,
    /// Upper bound for a single ping / setup command (`0s` = no timeout).
    pub timeout: Duration,
    /// Upper bound for copying the script or libraries (`0s` = no timeout).
    pub copy_timeout: Duration,

    /// Interpreter used on the kit.
    pub interpreter: String,

    /// Library directory on the kit, relative to the login home.
    pub remote_dir: String,
    /// Local directory holding the library version stamp.
    pub state_dir: PathBuf,
    /// Library trees copied to `remote_dir`.
    pub libraries: Vec<PathBuf>,
    /// Fonts directory copied to `remote_dir`.
    pub fonts_dir: Option<PathBuf>,
    /// Version written to the stamp file after a successful sync.
    pub lib_version: String,
    /// Sync libraries even if the stamp matches (a kit may have been reflashed).
    pub force_lib_sync: bool,

    /// Time the local `ssh` process gets to exit after SIGTERM before SIGKILL.
    pub kill_grace: Duration,
}

impl RemoteConfig {
    /// `user@host`.
    #[inline]
    pub fn address(&self) -> String {
        format!("{}@{}", self.user, self.host)
    }

    /// Ping / setup timeout as an `Option`.
    #[inline]
    pub fn command_timeout(&self) -> Option<Duration> {
        non_zero(self.timeout)
    }

    /// Copy timeout as an `Option`.
    #[inline]
    pub fn copy_timeout(&self) -> Option<Duration> {
        non_zero(self.copy_timeout)
    }

    /// Path of the library version stamp.
    #[inline]
    pub fn stamp_file(&self) -> PathBuf {
        self.state_dir.join("written_lib")
    }

    /// Path of the public half of `key_file`.
    pub fn public_key_file(&self) -> PathBuf {
        let mut name = self.key_file.clone().into_os_string();
        name.push(".pub");
        PathBuf::from(name)
    }
}

impl Default for RemoteConfig {
    /// Default configuration targets `powerup@powerup.local` with a 5s heartbeat
    /// and 5s connect timeout; remote execution itself is disabled.
    fn default() -> Self {
        let home = home_dir();
        Self {
            enabled: false,
            host: "powerup.local".to_string(),
            user: "powerup".to_string(),
            ping: "ping".to_string(),
            ssh: "ssh".to_string(),
            scp: "scp".to_string(),
            keygen: "ssh-keygen".to_string(),
            sshpass: "sshpass".to_string(),
            bootstrap_password: Some("kano".to_string()),
            key_file: home.join(".ssh").join("powerup.rsa"),
            ssh_options: [
                "-oLogLevel=quiet",
                "-oUserKnownHostsFile=/dev/null",
                "-oStrictHostKeyChecking=no",
                "-oConnectTimeout=5",
            ]
            .into_iter()
            .map(String::from)
            .collect(),
            heartbeat_interval: Duration::from_secs(5),
            timeout: Duration::from_secs(5),
            copy_timeout: Duration::from_secs(60),
            interpreter: "python".to_string(),
            remote_dir: ".powerup".to_string(),
            state_dir: home.join(".powerup"),
            libraries: Vec::new(),
            fonts_dir: None,
            lib_version: env!("CARGO_PKG_VERSION").to_string(),
            force_lib_sync: true,
            kill_grace: Duration::from_secs(2),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bring_up_only_with_remote_enabled() {
        let mut cfg = RouterConfig::default();
        assert!(cfg.bring_up().is_none());
        cfg.remote.enabled = true;
        assert_eq!(
            cfg.bring_up().map(|c| c.program.as_str()),
            Some("sudo")
        );
        cfg.network_bring_up = None;
        assert!(cfg.bring_up().is_none());
    }

    #[test]
    fn remote_paths() {
        let mut cfg = RemoteConfig::default();
        cfg.key_file = PathBuf::from("/k/powerup.rsa");
        cfg.state_dir = PathBuf::from("/s");
        assert_eq!(cfg.public_key_file(), PathBuf::from("/k/powerup.rsa.pub"));
        assert_eq!(cfg.stamp_file(), PathBuf::from("/s/written_lib"));
        assert_eq!(cfg.address(), "powerup@powerup.local");
        cfg.timeout = Duration::ZERO;
        assert_eq!(cfg.command_timeout(), None);
    }

    #[test]
    fn sentinels() {
        let mut cfg = RouterConfig::default();
        cfg.bus_capacity = 0;
        assert_eq!(cfg.bus_capacity_clamped(), 1);
        assert!(cfg.script_path().ends_with("powerup-code-all.py"));
    }
}
