use crate::error::{ConnectionError, Result};
use crate::logging::ServerLogger;
use mcp_types::{ProcessConfig, StderrMode};
use rmcp::transport::TokioChildProcess;
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tracing::{debug, info};

/// Spawn the server process. The child inherits our environment with the
/// declared variables layered on top.
pub fn spawn(config: &ProcessConfig, logger: &ServerLogger) -> Result<TokioChildProcess> {
    let mut command = Command::new(&config.command);
    command
        .args(&config.args)
        .envs(&config.env)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .kill_on_drop(true);

    let stderr = match config.stderr {
        StderrMode::Pipe => Stdio::piped(),
        StderrMode::Inherit => Stdio::inherit(),
        StderrMode::Ignore => Stdio::null(),
    };

    let (transport, stderr) = TokioChildProcess::builder(command)
        .stderr(stderr)
        .spawn()
        .map_err(|e| ConnectionError::Spawn(format!("'{}': {}", config.command, e)))?;

    info!(server = %logger.server(), "Started MCP server process: {} {}", config.command, config.args.join(" "));
    logger.info(format!("Started process: {} {}", config.command, config.args.join(" ")));

    if let Some(stderr) = stderr {
        let logger = logger.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) if line.trim().is_empty() => continue,
                    Ok(Some(line)) => logger.info(line),
                    Ok(None) => break,
                    Err(e) => {
                        logger.warn(format!("Failed to read stderr: {}", e));
                        break;
                    }
                }
            }
            debug!(server = %logger.server(), "Server stderr closed");
        });
    }

    Ok(transport)
}
