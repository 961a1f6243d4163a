use async_trait::async_trait;
use log::info;
use pocketcam::supervisor::PowerControl;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

/// Powers the board down through the init system. A restart only stops the
/// daemon; the service manager brings it back.
pub struct SystemPower {
    shutdown_token: CancellationToken,
    poweroff: String,
    reboot: String,
}

impl SystemPower {
    pub fn new(shutdown_token: CancellationToken) -> Self {
        Self {
            shutdown_token,
            poweroff: "poweroff".to_string(),
            reboot: "reboot".to_string(),
        }
    }

    async fn run(program: &str) -> std::io::Result<()> {
        let status = Command::new(program).status().await?;
        if !status.success() {
            return Err(std::io::Error::other(format!(
                "{program} exited with {status}"
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl PowerControl for SystemPower {
    async fn power_off(&mut self) -> std::io::Result<()> {
        info!("powering off");
        Self::run(&self.poweroff).await
    }

    async fn reboot(&mut self) -> std::io::Result<()> {
        info!("rebooting");
        Self::run(&self.reboot).await
    }

    async fn restart(&mut self) -> std::io::Result<()> {
        info!("restarting daemon");
        self.shutdown_token.cancel();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_restart_cancels_shutdown_token() {
        let token = CancellationToken::new();
        let mut power = SystemPower::new(token.clone());
        power.restart().await.unwrap();
        assert!(token.is_cancelled());
    }

    #[tokio::test]
    async fn test_failed_command_is_an_error() {
        let mut power = SystemPower {
            shutdown_token: CancellationToken::new(),
            poweroff: "false".to_string(),
            reboot: "/nonexistent/reboot".to_string(),
        };
        assert!(power.power_off().await.is_err());
        assert!(power.reboot().await.is_err());
    }
}
