use super::error::TrackerError;
use super::response::{parse_compact_peers, AnnounceRequest, AnnounceResponse};
use crate::bencode::decode;
use crate::config::TRACKER_TIMEOUT;
use reqwest::Client;

/// An HTTP(S) tracker endpoint.
pub struct HttpTracker {
    client: Client,
    url: String,
}

impl HttpTracker {
    pub fn new(url: &str) -> Result<Self, TrackerError> {
        if !url.starts_with("http://") && !url.starts_with("https://") {
            return Err(TrackerError::InvalidUrl(url.to_string()));
        }

        let client = Client::builder()
            .timeout(TRACKER_TIMEOUT)
            .build()
            .map_err(TrackerError::Http)?;

        Ok(Self {
            client,
            url: url.to_string(),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub async fn announce(
        &self,
        request: &AnnounceRequest,
    ) -> Result<AnnounceResponse, TrackerError> {
        let mut url = format!(
            "{}?info_hash={}&peer_id={}&port={}&uploaded={}&downloaded={}&left={}&compact=1",
            self.url,
            percent_encode(&request.info_hash),
            percent_encode(&request.peer_id),
            request.port,
            request.uploaded,
            request.downloaded,
            request.left,
        );
        let event = request.event.as_str();
        if !event.is_empty() {
            url.push_str("&event=");
            url.push_str(event);
        }

        let http_response = self.client.get(&url).send().await?;
        let body = http_response.bytes().await?;

        parse_announce_body(&body)
    }
}

pub(super) fn parse_announce_body(body: &[u8]) -> Result<AnnounceResponse, TrackerError> {
    let value = decode(body)?;
    let dict = value
        .as_dict()
        .ok_or(TrackerError::InvalidResponse("expected dictionary"))?;

    if let Some(reason) = dict
        .get(b"failure reason".as_slice())
        .and_then(|v| v.as_str())
    {
        return Err(TrackerError::Failure(reason.to_string()));
    }

    let interval = dict
        .get(b"interval".as_slice())
        .and_then(|v| v.as_int())
        .ok_or(TrackerError::InvalidResponse("missing interval"))? as u32;

    let mut response = AnnounceResponse::new(interval);
    response.seeders = dict
        .get(b"complete".as_slice())
        .and_then(|v| v.as_int())
        .map(|v| v as u32);
    response.leechers = dict
        .get(b"incomplete".as_slice())
        .and_then(|v| v.as_int())
        .map(|v| v as u32);

    if let Some(peers) = dict.get(b"peers".as_slice()) {
        if let Some(packed) = peers.as_bytes() {
            // Compact form: a packed byte string.
            response.peers = parse_compact_peers(packed);
        } else if let Some(list) = peers.as_list() {
            // Dictionary form: a list of {ip, port}.
            for entry in list {
                let ip = entry
                    .get(b"ip")
                    .and_then(|v| v.as_str())
                    .and_then(|s| s.parse().ok());
                let port = entry
                    .get(b"port")
                    .and_then(|v| v.as_int())
                    .map(|p| p as u16);
                if let (Some(ip), Some(port)) = (ip, port) {
                    response.peers.push(std::net::SocketAddr::new(ip, port));
                }
            }
        }
    }

    Ok(response)
}

/// Percent-encodes raw bytes for a query string; unreserved characters pass
/// through untouched.
fn percent_encode(bytes: &[u8]) -> String {
    use std::fmt::Write as _;
    bytes.iter().fold(String::new(), |mut out, &b| {
        if b.is_ascii_alphanumeric() || matches!(b, b'-' | b'_' | b'.' | b'~') {
            out.push(b as char);
        } else {
            let _ = write!(out, "%{b:02X}");
        }
        out
    })
}
