//! kubeadm-backed bootstrap tool.
//!
//! Each role action shells out to the host's `kubeadm` binary. Calls
//! block until kubeadm finishes; the orchestrator runs them on a
//! blocking worker.

use std::process::Command;

use anyhow::{bail, Context};
use tracing::info;

use convene_cluster::{BootstrapTool, JoinConfig};

#[derive(Default)]
pub struct Kubeadm;

impl Kubeadm {
    pub fn new() -> Self {
        Self
    }

    fn run(args: &[&str]) -> anyhow::Result<()> {
        info!(?args, "running kubeadm");
        let status = Command::new("kubeadm")
            .args(args)
            .status()
            .context("spawning kubeadm")?;
        if !status.success() {
            bail!("kubeadm {} exited with {status}", args.join(" "));
        }
        Ok(())
    }
}

impl BootstrapTool for Kubeadm {
    fn genesis(&self, config: &JoinConfig) -> anyhow::Result<()> {
        Self::run(&[
            "init",
            "--token",
            &config.token,
            "--certificate-key",
            &config.certificate_key,
            "--upload-certs",
            "--control-plane-endpoint",
            &config.endpoint,
        ])
    }

    fn join_control_plane(&self, config: &JoinConfig) -> anyhow::Result<()> {
        Self::run(&[
            "join",
            &config.endpoint,
            "--token",
            &config.token,
            "--discovery-token-unsafe-skip-ca-verification",
            "--control-plane",
            "--certificate-key",
            &config.certificate_key,
        ])
    }

    fn join_worker(&self, config: &JoinConfig) -> anyhow::Result<()> {
        Self::run(&[
            "join",
            &config.endpoint,
            "--token",
            &config.token,
            "--discovery-token-unsafe-skip-ca-verification",
        ])
    }
}
