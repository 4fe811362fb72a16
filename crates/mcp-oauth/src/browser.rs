use crate::{OAuthError, Result};
use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, info};

/// Opens an authorization URL for the user.
#[async_trait]
pub trait BrowserOpener: Send + Sync {
    async fn open(&self, url: &str) -> Result<()>;
}

/// Launches the user's default system browser.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemBrowser;

#[async_trait]
impl BrowserOpener for SystemBrowser {
    async fn open(&self, url: &str) -> Result<()> {
        info!("Opening browser for OAuth authorization");
        debug!("Authorization URL: {}", url);

        for &(program, args) in launchers() {
            debug!("Trying browser launcher: {}", program);
            match Command::new(program).args(args).arg(url).status().await {
                Ok(status) if status.success() => {
                    debug!("Launched browser with {}", program);
                    return Ok(());
                }
                Ok(status) => debug!("Browser launcher {} exited with {}", program, status),
                Err(e) => debug!("Browser launcher {} unavailable: {}", program, e),
            }
        }

        Err(OAuthError::BrowserLaunch(format!(
            "No browser launcher succeeded; open {} manually",
            url
        )))
    }
}

type Launcher = (&'static str, &'static [&'static str]);

#[cfg(target_os = "windows")]
const LAUNCHERS: &[Launcher] = &[("cmd", &["/c", "start", ""])];

#[cfg(target_os = "macos")]
const LAUNCHERS: &[Launcher] = &[("open", &[])];

#[cfg(not(any(target_os = "windows", target_os = "macos")))]
const LAUNCHERS: &[Launcher] = &[
    ("xdg-open", &[]),
    ("gnome-open", &[]),
    ("kde-open", &[]),
    ("sensible-browser", &[]),
];

fn launchers() -> &'static [Launcher] {
    LAUNCHERS
}
