//! HTTP delivery of execution callbacks

use std::time::Duration;

use reqwest::blocking::Client;
use tracing::debug;

use super::manager::CallbackClient;
use super::ExecutionResponse;
use crate::error::{Result, RteError};

pub const EXECUTION_CALLBACK_PATH: &str = "/internal/v1/callbacks/execution";

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Posts `ExecutionResponse`s to the API at `host:port`
pub struct HttpCallbackClient {
    client: Client,
    url: String,
}

impl HttpCallbackClient {
    pub fn new(host_port: &str) -> Result<Self> {
        let client = Client::builder().timeout(REQUEST_TIMEOUT).build()?;
        Ok(HttpCallbackClient {
            client,
            url: format!("http://{}{}", host_port, EXECUTION_CALLBACK_PATH),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

impl CallbackClient for HttpCallbackClient {
    fn post_execution(&self, response: &ExecutionResponse) -> Result<()> {
        debug!(url = %self.url, invocation_id = %response.invocation_id, "calling execution callback");
        let reply = self.client.post(&self.url).json(response).send()?;
        if !reply.status().is_success() {
            return Err(RteError::Io(format!(
                "execution callback failed with status {}",
                reply.status()
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::io::{Read, Write};
    use std::net::TcpListener;
    use std::thread;

    fn response() -> ExecutionResponse {
        ExecutionResponse {
            account_id: "acc".to_string(),
            status: "FINISHED".to_string(),
            error_description: String::new(),
            invocation_id: "inv-1".to_string(),
            callback: "http://client/cb".to_string(),
            snippet_id: "snip".to_string(),
            rte_id: "rte".to_string(),
            started_on: Utc::now(),
            finished_on: None,
            elapsed_time: Duration::from_millis(5),
        }
    }

    fn serve_once(status_line: &'static str) -> (String, thread::JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let handle = thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let mut buf = vec![0u8; 8192];
            let n = stream.read(&mut buf).unwrap();
            write!(stream, "{}\r\nContent-Length: 0\r\nConnection: close\r\n\r\n", status_line)
                .unwrap();
            String::from_utf8_lossy(&buf[..n]).to_string()
        });
        (addr, handle)
    }

    #[test]
    fn test_posts_to_execution_path() {
        let (addr, server) = serve_once("HTTP/1.1 200 OK");
        let client = HttpCallbackClient::new(&addr).unwrap();
        assert_eq!(
            client.url(),
            format!("http://{}/internal/v1/callbacks/execution", addr)
        );
        client.post_execution(&response()).unwrap();
        let request = server.join().unwrap();
        assert!(request.starts_with("POST /internal/v1/callbacks/execution"));
    }

    #[test]
    fn test_error_status_is_reported() {
        let (addr, server) = serve_once("HTTP/1.1 500 Internal Server Error");
        let client = HttpCallbackClient::new(&addr).unwrap();
        let err = client.post_execution(&response()).unwrap_err();
        assert!(err.to_string().contains("500"));
        server.join().unwrap();
    }
}
