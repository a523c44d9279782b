//! Resolving snippet source text from a start event

use std::fs;
use std::path::Path;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use tracing::debug;
use uuid::Uuid;

use crate::error::{Result, RteError};

/// Resolve the code of a start event
///
/// `url` selects the strategy: `base64://` decodes `code` (or the URL
/// remainder when `code` is empty), `http://` downloads into `tmp_dir` and
/// reads the file back. An empty `url` means `code` is already source text.
pub fn fetch_code(url: &str, code: &str, tmp_dir: &Path) -> Result<String> {
    if url.is_empty() && code.is_empty() {
        return Err(RteError::CodeFetch("URL or code empty".to_string()));
    }
    if url.is_empty() {
        return Ok(code.to_string());
    }

    let (scheme, rest) = url.split_once("://").unwrap_or(("", url));
    match scheme {
        "base64" => {
            debug!("base64 source detected");
            let encoded = if code.is_empty() { rest } else { code };
            let bytes = STANDARD
                .decode(encoded.trim())
                .map_err(|e| RteError::CodeFetch(e.to_string()))?;
            String::from_utf8(bytes).map_err(|e| RteError::CodeFetch(e.to_string()))
        }
        "s3" => Err(RteError::CodeFetch("S3 schema not supported!".to_string())),
        "http" => {
            debug!(url, "http source detected");
            download(url, tmp_dir)
        }
        other => Err(RteError::CodeFetch(format!("Unknow schema detected: {}", other))),
    }
}

fn download(url: &str, tmp_dir: &Path) -> Result<String> {
    let path = tmp_dir.join(format!("rte-{}", Uuid::new_v4()));
    let body = reqwest::blocking::get(url)
        .and_then(|response| response.error_for_status())
        .and_then(|response| response.bytes())
        .map_err(|e| RteError::CodeFetch(e.to_string()))?;
    fs::write(&path, &body)?;
    let code = fs::read_to_string(&path);
    let _ = fs::remove_file(&path);
    Ok(code?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::net::TcpListener;
    use std::thread;

    #[test]
    fn test_fetch_code() {
        let tmp = std::env::temp_dir();
        let cases = vec![
            ("", "return 1", Ok("return 1")),
            ("base64://", "cmV0dXJuIDE=", Ok("return 1")),
            ("base64://cmV0dXJuIDI=", "", Ok("return 2")),
            ("", "", Err("URL or code empty")),
            ("s3://bucket/key", "x", Err("S3 schema not supported!")),
            ("ftp://host/file", "x", Err("Unknow schema detected: ftp")),
        ];
        for (url, code, expected) in cases {
            let got = fetch_code(url, code, &tmp).map_err(|e| e.to_string());
            assert_eq!(
                got,
                expected.map(str::to_string).map_err(str::to_string),
                "{}",
                url
            );
        }
    }

    #[test]
    fn test_fetch_over_http() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let server = thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let mut buf = [0u8; 1024];
            let _ = stream.read(&mut buf).unwrap();
            let body = "function main() return 'remote' end";
            write!(
                stream,
                "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                body.len(),
                body
            )
            .unwrap();
        });

        let dir = tempfile::tempdir().unwrap();
        let url = format!("http://{}/snippets/1", addr);
        let code = fetch_code(&url, "ignored", dir.path()).unwrap();
        assert_eq!(code, "function main() return 'remote' end");
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 0);
        server.join().unwrap();
    }
}
