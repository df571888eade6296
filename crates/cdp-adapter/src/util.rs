use anyhow::{anyhow, Result};
use chromiumoxide::async_process::Child;
use futures::io::{AsyncBufReadExt, BufReader};
use futures::stream::StreamExt;
use tokio::time::{timeout, Duration};

/// Reads the launched browser's stderr until it announces its DevTools websocket.
pub async fn extract_ws_url(child: &mut Child) -> Result<String> {
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| anyhow!("browser process has no stderr handle"))?;
    let mut lines = BufReader::new(stderr).lines();
    let mut seen = Vec::new();

    let scan = async {
        while let Some(line) = lines.next().await {
            let line = line?;
            if let Some(url) = devtools_url_in(&line) {
                return Ok(url);
            }
            if seen.len() < 8 {
                seen.push(line);
            }
        }
        Err(anyhow!(
            "browser exited before announcing a devtools endpoint: {}",
            seen.join(" | ")
        ))
    };

    timeout(Duration::from_secs(20), scan)
        .await
        .map_err(|_| anyhow!("timed out waiting for the devtools endpoint"))?
}

fn devtools_url_in(line: &str) -> Option<String> {
    let (_, tail) = line.rsplit_once("listening on ")?;
    let url = tail.trim();
    (url.starts_with("ws") && url.contains("/devtools/browser/")).then(|| url.to_string())
}
