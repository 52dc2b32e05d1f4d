//! A blocking json-rpc client, talking HTTP POST to a canopy node (or its wallet server).
use std::path::PathBuf;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::time::Duration;

use log::debug;
use reqwest::header::CONNECTION;
use reqwest::header::CONTENT_TYPE;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::json;
use serde_json::Value;

use crate::error::Error;

type Result<T> = std::result::Result<T, Error>;

/// Where and how we reach the server
#[derive(Debug, Clone)]
pub struct RpcConfig {
    /// `host:port` of the node's rpc server
    pub server: String,
    /// Use `https` instead of `http`
    pub tls: bool,
    /// A PEM root certificate to trust, for servers with a self-signed certificate
    pub rpc_cert: Option<PathBuf>,
    /// Accept any certificate. Only meaningful with `tls`.
    pub tls_skip_verify: bool,
    pub user: String,
    pub password: String,
    /// `host:port` of a SOCKS5 proxy
    pub proxy: Option<String>,
    pub proxy_user: Option<String>,
    pub proxy_password: Option<String>,
    /// Talk to `wallet_server` instead of `server`
    pub wallet: bool,
    pub wallet_server: String,
    pub timeout: Option<Duration>,
}

impl Default for RpcConfig {
    fn default() -> Self {
        RpcConfig {
            server: "127.0.0.1:8332".into(),
            tls: false,
            rpc_cert: None,
            tls_skip_verify: false,
            user: String::new(),
            password: String::new(),
            proxy: None,
            proxy_user: None,
            proxy_password: None,
            wallet: false,
            wallet_server: "127.0.0.1:8334".into(),
            timeout: None,
        }
    }
}

#[derive(Debug, Deserialize)]
struct RpcErrorObject {
    code: i64,
    message: String,
}

#[derive(Debug, Deserialize)]
struct RpcResponse {
    #[serde(default)]
    result: Value,
    #[serde(default)]
    error: Option<RpcErrorObject>,
}

#[derive(Debug)]
pub struct RpcClient {
    client: reqwest::blocking::Client,
    config: RpcConfig,
    next_id: AtomicU64,
}

impl RpcClient {
    pub fn new(config: RpcConfig) -> Result<Self> {
        let mut builder = reqwest::blocking::Client::builder();

        if let Some(proxy) = &config.proxy {
            if proxy.is_empty() {
                return Err(Error::InvalidConfig("empty proxy address".into()));
            }

            let mut proxy = reqwest::Proxy::all(format!("socks5://{proxy}"))?;
            if let Some(user) = &config.proxy_user {
                let password = config.proxy_password.as_deref().unwrap_or_default();
                proxy = proxy.basic_auth(user, password);
            }

            builder = builder.proxy(proxy);
        }

        if config.tls {
            if let Some(path) = &config.rpc_cert {
                let pem = std::fs::read(path)?;
                builder = builder.add_root_certificate(reqwest::Certificate::from_pem(&pem)?);
            }

            builder = builder.danger_accept_invalid_certs(config.tls_skip_verify);
        }

        if let Some(timeout) = config.timeout {
            builder = builder.timeout(timeout);
        }

        Ok(RpcClient {
            client: builder.build()?,
            config,
            next_id: AtomicU64::new(1),
        })
    }

    /// The url every request is posted to
    pub fn url(&self) -> String {
        let protocol = if self.config.tls { "https" } else { "http" };
        let server = if self.config.wallet {
            &self.config.wallet_server
        } else {
            &self.config.server
        };

        format!("{protocol}://{server}")
    }

    /// Posts an already serialized json-rpc request and returns the `result` field of the
    /// answer.
    ///
    /// A non-2xx status is an [Error::Http] carrying the response body, and an `error` field
    /// in the answer is an [Error::Rpc].
    pub fn send_post_request(&self, request: Vec<u8>) -> Result<Value> {
        let url = self.url();
        if self.config.wallet {
            debug!("using wallet server {url}");
        }

        let response = self
            .client
            .post(&url)
            .header(CONTENT_TYPE, "application/json")
            .header(CONNECTION, "close")
            .basic_auth(&self.config.user, Some(&self.config.password))
            .body(request)
            .send()?;

        let status = response.status();
        let body = response.bytes()?;

        if !status.is_success() {
            return Err(Error::Http {
                status: status.as_u16(),
                body: String::from_utf8_lossy(&body).into_owned(),
            });
        }

        let response: RpcResponse = serde_json::from_slice(&body)?;
        if let Some(error) = response.error {
            return Err(Error::Rpc {
                code: error.code,
                message: error.message,
            });
        }

        Ok(response.result)
    }

    /// Calls `method` and deserializes its result
    pub fn call<T: DeserializeOwned>(&self, method: &str, params: &[Value]) -> Result<T> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let request = json!({
            "jsonrpc": "1.0",
            "id": id,
            "method": method,
            "params": params,
        });

        let result = self.send_post_request(serde_json::to_vec(&request)?)?;
        Ok(serde_json::from_value(result)?)
    }
}

#[cfg(test)]
mod tests {
    use std::io::BufRead;
    use std::io::BufReader;
    use std::io::Read;
    use std::io::Write;
    use std::net::TcpListener;
    use std::thread::JoinHandle;

    use serde_json::json;
    use serde_json::Value;

    use super::RpcClient;
    use super::RpcConfig;
    use crate::error::Error;

    /// Serves exactly one request with a canned answer, returning the request it got
    fn serve_once(status: &'static str, body: &'static str) -> (String, JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let address = listener.local_addr().unwrap().to_string();

        let handle = std::thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            let mut reader = BufReader::new(stream.try_clone().unwrap());

            let mut request = String::new();
            let mut content_length = 0;
            loop {
                let mut line = String::new();
                reader.read_line(&mut line).unwrap();
                if let Some(length) = line.to_lowercase().strip_prefix("content-length:") {
                    content_length = length.trim().parse().unwrap();
                }

                request.push_str(&line);
                if line == "\r\n" {
                    break;
                }
            }

            let mut payload = vec![0; content_length];
            reader.read_exact(&mut payload).unwrap();
            request.push_str(&String::from_utf8(payload).unwrap());

            let mut stream = stream;
            write!(
                stream,
                "HTTP/1.1 {status}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
                body.len()
            )
            .unwrap();

            request
        });

        (address, handle)
    }

    fn client(server: String) -> RpcClient {
        RpcClient::new(RpcConfig {
            server,
            user: "alice".into(),
            password: "hunter2".into(),
            ..Default::default()
        })
        .unwrap()
    }

    #[test]
    fn test_call() {
        let (address, server) = serve_once("200 OK", r#"{"result":42,"error":null,"id":1}"#);
        let height: u32 = client(address).call("getblockcount", &[]).unwrap();
        assert_eq!(height, 42);

        let request = server.join().unwrap();
        assert!(request.starts_with("POST / HTTP/1.1"));
        // alice:hunter2
        assert!(request.contains("YWxpY2U6aHVudGVyMg=="));
        assert!(request.contains(r#""method":"getblockcount""#));
    }

    #[test]
    fn test_rpc_error() {
        let (address, server) = serve_once(
            "200 OK",
            r#"{"result":null,"error":{"code":-8,"message":"Block height out of range"},"id":1}"#,
        );
        let result = client(address).call::<Value>("getblockhash", &[json!(1_000_000)]);
        server.join().unwrap();

        match result {
            Err(Error::Rpc { code, message }) => {
                assert_eq!(code, -8);
                assert_eq!(message, "Block height out of range");
            }
            other => panic!("expected an rpc error, got {other:?}"),
        }
    }

    #[test]
    fn test_http_error() {
        let (address, server) = serve_once("500 Internal Server Error", "");
        let result = client(address).send_post_request(b"{}".to_vec());
        server.join().unwrap();

        let error = result.unwrap_err();
        assert!(matches!(error, Error::Http { status: 500, .. }));
        assert_eq!(error.to_string(), "500 Internal Server Error");

        let (address, server) = serve_once("401 Unauthorized", "bad credentials");
        let result = client(address).send_post_request(b"{}".to_vec());
        server.join().unwrap();

        assert_eq!(result.unwrap_err().to_string(), "bad credentials");
    }

    #[test]
    fn test_bad_json() {
        let (address, server) = serve_once("200 OK", "this is not json");
        let result = client(address).send_post_request(b"{}".to_vec());
        server.join().unwrap();

        assert!(matches!(result, Err(Error::Serde(_))));
    }

    #[test]
    fn test_unreachable() {
        // bind and drop, so nothing listens there
        let address = TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .to_string();

        let result = client(address).send_post_request(b"{}".to_vec());
        assert!(matches!(result, Err(Error::Transport(_))));
    }

    #[test]
    fn test_url() {
        let config = RpcConfig {
            tls: true,
            wallet: true,
            wallet_server: "10.0.0.1:8334".into(),
            ..Default::default()
        };
        assert_eq!(RpcClient::new(config).unwrap().url(), "https://10.0.0.1:8334");

        let config = RpcConfig {
            tls: true,
            rpc_cert: Some("/this/cert/does/not/exist.pem".into()),
            ..Default::default()
        };
        assert!(matches!(RpcClient::new(config), Err(Error::Io(_))));

        let config = RpcConfig {
            proxy: Some(String::new()),
            ..Default::default()
        };
        assert!(matches!(
            RpcClient::new(config),
            Err(Error::InvalidConfig(_))
        ));
    }
}
