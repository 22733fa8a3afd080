//! Byte sources for the `play` command: local files and HTTP downloads.

use std::fs::File;
use std::io::Read;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use stream_player::StreamInfo;

const HTTP_TIMEOUT: Duration = Duration::from_secs(10);

/// An opened input plus what is known about it up front.
pub struct Input {
    pub reader: Box<dyn Read + Send>,
    pub info: StreamInfo,
}

pub fn open(input: &str, mime: Option<String>) -> Result<Input> {
    let mut opened = if is_url(input) {
        open_http(input)?
    } else {
        open_file(Path::new(input))?
    };
    if mime.is_some() {
        opened.info.mime_type = mime;
    }
    Ok(opened)
}

fn is_url(input: &str) -> bool {
    input.starts_with("http://") || input.starts_with("https://")
}

fn open_file(path: &Path) -> Result<Input> {
    let file = File::open(path).with_context(|| format!("open {path:?}"))?;
    let len = file.metadata().ok().map(|m| m.len());
    Ok(Input {
        reader: Box::new(file),
        info: StreamInfo {
            expected_len: len,
            mime_type: mime_for_extension(path).map(str::to_string),
        },
    })
}

fn open_http(url: &str) -> Result<Input> {
    let resp = ureq::get(url)
        .config()
        .timeout_connect(Some(HTTP_TIMEOUT))
        .build()
        .call()
        .with_context(|| format!("GET {url}"))?;

    let header = |name: &str| {
        resp.headers()
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string())
    };
    let mime_type = header("Content-Type");
    let expected_len = header("Content-Length").and_then(|s| s.parse::<u64>().ok());
    tracing::info!(url, status = %resp.status(), ?mime_type, ?expected_len, "http source opened");

    let (_, body) = resp.into_parts();
    Ok(Input {
        reader: Box::new(body.into_reader()),
        info: StreamInfo {
            expected_len,
            mime_type,
        },
    })
}

fn mime_for_extension(path: &Path) -> Option<&'static str> {
    let ext = path.extension()?.to_str()?.to_ascii_lowercase();
    match ext.as_str() {
        "mp3" | "mp2" | "mp1" | "mpga" => Some("audio/mpeg"),
        "wav" | "wave" => Some("audio/wav"),
        _ => None,
    }
}
