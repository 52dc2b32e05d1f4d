use std::path::PathBuf;
use std::time::Duration;

use canopy_cli::RpcClient;
use canopy_cli::RpcConfig;
use clap::Parser;
use serde_json::Value;

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let client = RpcClient::new(cli.rpc_config())?;

    let params: Vec<Value> = cli.params.iter().map(|param| parse_param(param)).collect();
    let result: Value = client.call(&cli.method, &params)?;

    match result {
        Value::String(s) => println!("{s}"),
        Value::Null => {}
        other => println!("{}", serde_json::to_string_pretty(&other)?),
    }

    Ok(())
}

/// Parameters that parse as json are sent as is (numbers, booleans, objects), anything else
/// is sent as a string
fn parse_param(param: &str) -> Value {
    serde_json::from_str(param).unwrap_or_else(|_| Value::String(param.to_string()))
}

#[derive(Debug, Parser)]
#[command(version, about = r#"
    A simple command line interface to a canopy node's json-rpc interface.
"#, long_about = None)]
pub struct Cli {
    /// The rpc server to connect to, as host:port
    #[arg(short = 's', long, value_name = "HOST:PORT", default_value = "127.0.0.1:8332")]
    pub rpc_server: String,
    /// The rpc username to use
    #[arg(short = 'u', long, value_name = "USERNAME", default_value = "")]
    pub rpc_user: String,
    /// The rpc password to use
    #[arg(short = 'P', long, value_name = "PASSWORD", default_value = "")]
    pub rpc_password: String,
    /// Connect over https
    #[arg(long)]
    pub tls: bool,
    /// A root certificate to trust for the rpc server
    #[arg(long, value_name = "FILE")]
    pub rpc_cert: Option<PathBuf>,
    /// Don't verify the server's certificate
    #[arg(long)]
    pub tls_skip_verify: bool,
    /// Connect through a SOCKS5 proxy, as host:port
    #[arg(long, value_name = "HOST:PORT")]
    pub proxy: Option<String>,
    #[arg(long, value_name = "USERNAME")]
    pub proxy_user: Option<String>,
    #[arg(long, value_name = "PASSWORD")]
    pub proxy_password: Option<String>,
    /// Send the command to the wallet server instead
    #[arg(short, long)]
    pub wallet: bool,
    #[arg(long, value_name = "HOST:PORT", default_value = "127.0.0.1:8334")]
    pub wallet_server: String,
    /// Give up after this many seconds
    #[arg(long, value_name = "SECONDS")]
    pub timeout: Option<u64>,
    /// The rpc method to call
    pub method: String,
    /// Its parameters
    pub params: Vec<String>,
}

impl Cli {
    fn rpc_config(&self) -> RpcConfig {
        RpcConfig {
            server: self.rpc_server.clone(),
            tls: self.tls,
            rpc_cert: self.rpc_cert.clone(),
            tls_skip_verify: self.tls_skip_verify,
            user: self.rpc_user.clone(),
            password: self.rpc_password.clone(),
            proxy: self.proxy.clone(),
            proxy_user: self.proxy_user.clone(),
            proxy_password: self.proxy_password.clone(),
            wallet: self.wallet,
            wallet_server: self.wallet_server.clone(),
            timeout: self.timeout.map(Duration::from_secs),
        }
    }
}
