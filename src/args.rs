use std::net::{AddrParseError, IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::Parser;

#[derive(Parser, Debug)]
#[command(version, about)]
pub struct Args {
    /// Whether clients connect over https.
    /// If so, the session cookie is sent as a secure cookie.
    #[arg(short, long)]
    secure: bool,

    /// The address to listen on. By default only the IPv4 loopback.
    #[arg(short, long)]
    address: Option<String>,

    /// The port to listen on.
    #[arg(short, long, default_value_t = 80)]
    port: u16,

    /// Where users, the transaction log and sessions are kept.
    #[arg(short, long, default_value = ".")]
    data_dir: PathBuf,

    /// Seconds a login stays valid.
    #[arg(long, default_value_t = 86400)]
    session_ttl: u64,

    /// Seconds between sweeps of expired sessions. Off by default, expired
    /// sessions are still refused and dropped when presented.
    #[arg(long)]
    reap_interval: Option<u64>,

    /// Grant admin to an existing user before serving. May be repeated.
    #[arg(long = "make-admin", value_name = "USERNAME")]
    make_admin: Vec<String>,

    /// Check every cached balance against the transaction log at startup.
    #[arg(long)]
    audit: bool,
}

impl Args {
    pub fn addr(&self) -> Result<SocketAddr, AddrParseError> {
        self.address
            .as_deref()
            .unwrap_or("127.0.0.1")
            .parse()
            .map(|addr: IpAddr| (addr, self.port).into())
    }

    pub fn secure(&self) -> bool {
        self.secure
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub fn session_ttl(&self) -> u64 {
        self.session_ttl
    }

    pub fn reap_interval(&self) -> Option<Duration> {
        self.reap_interval
            .filter(|&secs| secs > 0)
            .map(Duration::from_secs)
    }

    pub fn admins(&self) -> &[String] {
        &self.make_admin
    }

    pub fn audit(&self) -> bool {
        self.audit
    }
}
