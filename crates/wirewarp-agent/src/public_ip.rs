//! Public IPv4 discovery for heartbeats.

use std::net::Ipv4Addr;
use std::time::Duration;

use tracing::debug;

pub const LOOKUP_TIMEOUT: Duration = Duration::from_secs(5);

/// Ask a plain-text "what is my IP" endpoint for this host's address.
///
/// Best-effort: any failure, or an answer that is not an IPv4 address, yields
/// `None`. An empty `url` disables the lookup.
pub async fn lookup(client: &reqwest::Client, url: &str) -> Option<String> {
    if url.is_empty() {
        return None;
    }
    let body = async {
        client
            .get(url)
            .timeout(LOOKUP_TIMEOUT)
            .send()
            .await?
            .error_for_status()?
            .text()
            .await
    }
    .await;

    match body {
        Ok(text) => match text.trim().parse::<Ipv4Addr>() {
            Ok(ip) => Some(ip.to_string()),
            Err(_) => {
                debug!(url, answer = %text.trim(), "public IP lookup returned no IPv4 address");
                None
            }
        },
        Err(e) => {
            debug!(url, error = %e, "public IP lookup failed");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    async fn serve_once(body: &'static str) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 1024];
            let _ = sock.read(&mut buf).await;
            let response = format!(
                "HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                body.len(),
                body
            );
            sock.write_all(response.as_bytes()).await.unwrap();
        });
        format!("http://{addr}/")
    }

    #[tokio::test]
    async fn parses_plain_text_answer() {
        let url = serve_once("203.0.113.7\n").await;
        let ip = lookup(&reqwest::Client::new(), &url).await;
        assert_eq!(ip.as_deref(), Some("203.0.113.7"));
    }

    #[tokio::test]
    async fn garbage_answer_is_none() {
        let url = serve_once("<html>nope</html>").await;
        assert_eq!(lookup(&reqwest::Client::new(), &url).await, None);
    }

    #[tokio::test]
    async fn empty_url_disables_lookup() {
        assert_eq!(lookup(&reqwest::Client::new(), "").await, None);
    }
}
