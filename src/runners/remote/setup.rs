//! SSH trust, library sync and remote power-off.
//!
//! Bootstrap commands authenticate with the kit's factory password (through
//! `sshpass`) because the key is not installed yet; everything else uses the key.

use std::path::Path;

use tokio::process::Command;
use tracing::{debug, error, info, warn};

use super::Inner;
use crate::boards::Board;
use crate::error::RunError;
use crate::runners::exec::{run_checked, run_status};

/// Name of the LEDs-off script staged for power-off.
const POWEROFF_SCRIPT: &str = "led_poweroff.py";

impl Inner {
    fn tool(&self, program: &str, keyed: bool) -> Command {
        let cfg = &self.cfg;
        let mut cmd = match (&cfg.bootstrap_password, keyed) {
            (Some(password), false) => {
                let mut cmd = Command::new(&cfg.sshpass);
                cmd.arg("-p").arg(password).arg(program);
                cmd
            }
            _ => Command::new(program),
        };
        if keyed {
            cmd.arg("-i").arg(&cfg.key_file);
        }
        cmd.args(&cfg.ssh_options);
        cmd
    }

    /// `ssh [-i key] <options> user@host <remote command>`.
    pub(super) fn ssh(&self, keyed: bool, remote_cmd: &str) -> Command {
        let mut cmd = self.tool(&self.cfg.ssh, keyed);
        cmd.arg(self.cfg.address()).arg(remote_cmd);
        cmd
    }

    /// `scp [-i key] <options> [-r] <local> user@host:<dest>`.
    pub(super) fn scp(&self, keyed: bool, recursive: bool, local: &Path, dest: &str) -> Command {
        let mut cmd = self.tool(&self.cfg.scp, keyed);
        if recursive {
            cmd.arg("-r");
        }
        cmd.arg(local).arg(format!("{}:{dest}", self.cfg.address()));
        cmd
    }

    /// Creates the local key pair if needed and installs the public key on the kit.
    pub(super) async fn ensure_ssh(&self) -> Result<(), RunError> {
        let cfg = &self.cfg;
        let timeout = cfg.command_timeout();

        if tokio::fs::metadata(&cfg.key_file).await.is_err() {
            if let Some(dir) = cfg.key_file.parent() {
                tokio::fs::create_dir_all(dir)
                    .await
                    .map_err(|e| RunError::transport(format!("Could not generate local SSH key: {e}")))?;
            }
            let mut keygen = Command::new(&cfg.keygen);
            keygen.args(["-q", "-t", "rsa", "-N", ""]).arg("-f").arg(&cfg.key_file);

            if let Err(e) = run_checked(&mut keygen, "Could not generate local SSH key", timeout).await {
                // Remove half-written keys so the next tick tries again.
                let _ = tokio::fs::remove_file(&cfg.key_file).await;
                let _ = tokio::fs::remove_file(cfg.public_key_file()).await;
                error!(error = %e.as_message(), "ssh key generation failed");
                return Err(RunError::transport("Could not generate local SSH key"));
            }
            info!(key = %cfg.key_file.display(), "generated ssh key for the kit");
        }

        // Always re-install the key: the kit may have been reflashed.
        run_checked(
            &mut self.ssh(false, "mkdir -p .ssh"),
            "Could not create remote .ssh directory",
            timeout,
        )
        .await?;
        run_checked(
            &mut self.scp(false, false, &cfg.public_key_file(), ".ssh/authorized_keys"),
            "Could not copy SSH key to remote Powerup Kit",
            cfg.copy_timeout(),
        )
        .await?;
        debug!("ssh trust established");
        Ok(())
    }

    /// Copies libraries and fonts to the kit unless the version stamp says they are current.
    pub(super) async fn ensure_lib(&self) -> Result<(), RunError> {
        let cfg = &self.cfg;
        let stamp = cfg.stamp_file();

        if let Err(e) = tokio::fs::create_dir_all(&cfg.state_dir).await {
            warn!(dir = %cfg.state_dir.display(), error = %e, "could not create local state directory");
        }

        if !cfg.force_lib_sync {
            if let Ok(written) = tokio::fs::read_to_string(&stamp).await {
                if written.trim() == cfg.lib_version {
                    debug!(version = %cfg.lib_version, "kit libraries up to date");
                    return Ok(());
                }
            }
        }

        run_checked(
            &mut self.ssh(false, &format!("mkdir -p {}", cfg.remote_dir)),
            "Could not create remote powerup directory",
            cfg.command_timeout(),
        )
        .await?;

        for lib in cfg.libraries.iter().chain(cfg.fonts_dir.iter()) {
            run_checked(
                &mut self.scp(false, true, lib, &cfg.remote_dir),
                "Could not copy library to remote Powerup Kit",
                cfg.copy_timeout(),
            )
            .await?;
            debug!(path = %lib.display(), "copied to kit");
        }

        tokio::fs::write(&stamp, &cfg.lib_version)
            .await
            .map_err(|e| RunError::transport(format!("Could not record library version: {e}")))?;
        info!(version = %cfg.lib_version, "kit libraries synced");
        Ok(())
    }

    /// Turns every LED off, then powers the kit down.
    ///
    /// Failing to stage the LEDs-off script is logged; the power-off is sent anyway.
    pub(super) async fn power_off(&self, board: &Board) -> Result<(), RunError> {
        let cfg = &self.cfg;
        let local = self.work_dir.join(POWEROFF_SCRIPT);
        let code = format!(
            "{}\n\nlight.all(False)\n\n{}",
            board.preamble(),
            board.postamble()
        );

        let staged = match tokio::fs::write(&local, code).await {
            Ok(()) => run_checked(
                &mut self.scp(true, false, &local, "/tmp"),
                "Error preparing LEDs off code",
                cfg.copy_timeout(),
            )
            .await
            .map(|_| ()),
            Err(e) => Err(RunError::transport(format!("Error preparing LEDs off code: {e}"))),
        };
        if let Err(e) = staged {
            error!(error = %e.as_message(), "could not stage LEDs off script");
        }

        let remote_cmd = format!(
            "PYTHONPATH=~/{} {} /tmp/{POWEROFF_SCRIPT} ; sudo poweroff",
            cfg.remote_dir, cfg.interpreter
        );
        let out = run_status(&mut self.ssh(true, &remote_cmd), "power off", cfg.copy_timeout()).await?;
        match out.code() {
            // 255: the connection dropped because the kit went down.
            0 | 255 => {
                info!("kit powering off");
                Ok(())
            }
            rc => {
                error!(rc, "remote power off failed");
                Err(RunError::transport(format!("Error powering off the Powerup Kit: rc={rc}")))
            }
        }
    }
}
