// ICY metadata probe - a second, metadata-only connection to the station
// that picks StreamTitle out of the interleaved metadata blocks

use std::sync::OnceLock;
use std::time::Duration;

use regex::Regex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{MetadataProvider, TrackInfo, TrackSource};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(15);
const RECONNECT_DELAY: Duration = Duration::from_secs(5);

/// Splits an ICY body into audio (discarded) and metadata blocks.
///
/// Every `metaint` bytes of audio are followed by one length byte and then
/// `length * 16` bytes of metadata text, NUL padded.
#[derive(Debug)]
pub struct IcyReader {
    metaint: usize,
    state: ReadState,
}

#[derive(Debug)]
enum ReadState {
    Audio { remaining: usize },
    Length,
    Metadata { remaining: usize, block: Vec<u8> },
}

impl IcyReader {
    pub fn new(metaint: usize) -> Self {
        Self {
            metaint,
            state: ReadState::Audio { remaining: metaint },
        }
    }

    /// Consume a chunk of the body, returning any stream titles completed in it
    pub fn feed(&mut self, mut data: &[u8]) -> Vec<String> {
        let mut titles = Vec::new();

        while !data.is_empty() {
            match &mut self.state {
                ReadState::Audio { remaining } => {
                    let skip = (*remaining).min(data.len());
                    *remaining -= skip;
                    data = &data[skip..];
                    if *remaining == 0 {
                        self.state = ReadState::Length;
                    }
                }
                ReadState::Length => {
                    let length = data[0] as usize * 16;
                    data = &data[1..];
                    self.state = if length == 0 {
                        ReadState::Audio { remaining: self.metaint }
                    } else {
                        ReadState::Metadata {
                            remaining: length,
                            block: Vec::with_capacity(length),
                        }
                    };
                }
                ReadState::Metadata { remaining, block } => {
                    let take = (*remaining).min(data.len());
                    block.extend_from_slice(&data[..take]);
                    *remaining -= take;
                    data = &data[take..];
                    if *remaining == 0 {
                        titles.extend(stream_title(&String::from_utf8_lossy(block)));
                        self.state = ReadState::Audio { remaining: self.metaint };
                    }
                }
            }
        }

        titles
    }
}

/// Pull `StreamTitle='...';` out of a metadata block
pub fn stream_title(block: &str) -> Option<String> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    let pattern = PATTERN
        .get_or_init(|| Regex::new(r"(?i)StreamTitle='([^']*)';").ok())
        .as_ref()?;

    let title = pattern.captures(block)?.get(1)?.as_str().trim();
    if title.is_empty() {
        None
    } else {
        Some(title.to_string())
    }
}

/// Default provider: one probe task per live run
pub struct IcyProvider {
    client: reqwest::Client,
    reconnect_delay: Duration,
}

impl IcyProvider {
    pub fn new(user_agent: &str) -> reqwest::Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(user_agent)
            .connect_timeout(CONNECT_TIMEOUT)
            .build()?;
        Ok(Self {
            client,
            reconnect_delay: RECONNECT_DELAY,
        })
    }
}

impl MetadataProvider for IcyProvider {
    fn attach(&self, source_url: &str) -> Option<Box<dyn TrackSource>> {
        let runtime = tokio::runtime::Handle::try_current().ok()?;
        let (tx, rx) = watch::channel(None);
        let task = runtime.spawn(probe(
            self.client.clone(),
            source_url.to_string(),
            self.reconnect_delay,
            tx,
        ));
        Some(Box::new(IcySource { latest: rx, task }))
    }
}

/// Latest title seen by the probe. Dropping it stops the probe.
struct IcySource {
    latest: watch::Receiver<Option<TrackInfo>>,
    task: JoinHandle<()>,
}

impl TrackSource for IcySource {
    fn latest(&self) -> Option<TrackInfo> {
        self.latest.borrow().clone()
    }
}

impl Drop for IcySource {
    fn drop(&mut self) {
        self.task.abort();
    }
}

enum ProbeEnd {
    NoMetadata,
    Closed,
}

async fn probe(
    client: reqwest::Client,
    url: String,
    reconnect_delay: Duration,
    latest: watch::Sender<Option<TrackInfo>>,
) {
    loop {
        match probe_once(&client, &url, &latest).await {
            Ok(ProbeEnd::NoMetadata) => {
                info!("{} does not interleave ICY metadata, no track info", url);
                return;
            }
            Ok(ProbeEnd::Closed) => debug!("ICY connection to {} closed", url),
            Err(e) => warn!("ICY probe for {} failed: {}", url, e),
        }
        tokio::time::sleep(reconnect_delay).await;
    }
}

async fn probe_once(
    client: &reqwest::Client,
    url: &str,
    latest: &watch::Sender<Option<TrackInfo>>,
) -> reqwest::Result<ProbeEnd> {
    let mut response = client
        .get(url)
        .header("Icy-MetaData", "1")
        .send()
        .await?
        .error_for_status()?;

    let metaint = response
        .headers()
        .get("icy-metaint")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<usize>().ok())
        .filter(|n| *n > 0);
    let Some(metaint) = metaint else {
        return Ok(ProbeEnd::NoMetadata);
    };
    debug!("ICY metadata every {} bytes from {}", metaint, url);

    let mut reader = IcyReader::new(metaint);
    while let Some(chunk) = response.chunk().await? {
        if let Some(title) = reader.feed(&chunk).pop() {
            let info = TrackInfo::from_stream_title(&title);
            latest.send_if_modified(|current| {
                if current.as_ref() == Some(&info) {
                    false
                } else {
                    debug!("Stream title: {}", title);
                    *current = Some(info);
                    true
                }
            });
        }
    }
    Ok(ProbeEnd::Closed)
}
