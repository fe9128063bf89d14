use clap::Parser;
use std::ffi::OsString;
use std::net::{IpAddr, SocketAddr, ToSocketAddrs};
use std::path::PathBuf;

/// Forward HTTP proxy with Digest/Basic proxy authentication.
///
/// Authentication is enabled as soon as any of --user-passwd,
/// --user-passwd-file or --allowed-client is given.
#[derive(Debug, Parser)]
#[command(name = "cowgate", version, about, long_about = None)]
pub struct Config {
    /// IP address to listen on.
    #[arg(short = 'i', long, env = "COWGATE_LISTEN_IP", default_value = "127.0.0.1")]
    pub listen_ip: IpAddr,

    /// Port(s) to listen on. Repeat or comma-separate to listen on several;
    /// users can be restricted to one of them.
    #[arg(
        short = 'p',
        long = "port",
        env = "COWGATE_PORT",
        value_delimiter = ',',
        default_value = "7777"
    )]
    pub ports: Vec<u16>,

    /// Disable logging.
    #[arg(short = 'q', long)]
    pub quiet: bool,

    /// Default log filter, overridden by RUST_LOG.
    #[arg(long, env = "COWGATE_LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// Inline credential, username:password[:port].
    #[arg(short = 'u', long, env = "COWGATE_USER_PASSWD")]
    pub user_passwd: Option<String>,

    /// File with one username:password[:port] per line.
    #[arg(short = 'f', long, env = "COWGATE_USER_PASSWD_FILE", value_parser = parse_path)]
    pub user_passwd_file: Option<PathBuf>,

    /// Comma-separated ip[/prefixlen] list of clients that need no credentials,
    /// e.g. 127.0.0.1,192.168.1.0/24.
    #[arg(short = 'w', long, env = "COWGATE_ALLOWED_CLIENT")]
    pub allowed_client: Option<String>,

    /// Hours an authenticated client IP may use the proxy without
    /// authenticating again.
    #[arg(short = 't', long, env = "COWGATE_AUTH_TIMEOUT", default_value_t = 2)]
    pub auth_timeout: u64,

    /// IP that outgoing connections are bound to.
    #[arg(short = 'b', long, env = "COWGATE_BIND_ADDR", value_parser = resolve_ip)]
    pub bind_addr: Option<IpAddr>,
}

impl Config {
    pub fn from_args<I, T>(args: I) -> Result<Config, clap::Error>
    where
        I: IntoIterator<Item = T>,
        T: Into<OsString> + Clone,
    {
        let mut config = Config::try_parse_from(args)?;
        // An empty value means the setting is absent.
        config.user_passwd = config.user_passwd.filter(|s| !s.is_empty());
        config.user_passwd_file = config
            .user_passwd_file
            .filter(|p| !p.as_os_str().is_empty());
        config.allowed_client = config.allowed_client.filter(|s| !s.is_empty());
        Ok(config)
    }

    pub fn requires_auth(&self) -> bool {
        self.user_passwd.is_some()
            || self.user_passwd_file.is_some()
            || self.allowed_client.is_some()
    }

    pub fn listen_addrs(&self) -> Vec<SocketAddr> {
        self.ports
            .iter()
            .map(|&port| SocketAddr::new(self.listen_ip, port))
            .collect()
    }
}

/// Unlike clap's default `PathBuf` parser this accepts an empty value.
fn parse_path(s: &str) -> Result<PathBuf, String> {
    Ok(PathBuf::from(s))
}

fn resolve_ip(s: &str) -> Result<IpAddr, String> {
    // Try parsing as IP address first
    if let Ok(ip) = s.parse::<IpAddr>() {
        return Ok(ip);
    }
    // Try DNS resolution
    let addr_str = format!("{s}:0");
    match addr_str.to_socket_addrs() {
        Ok(mut addrs) => match addrs.next() {
            Some(addr) => Ok(addr.ip()),
            None => Err(format!("failed to resolve {s}")),
        },
        Err(e) => Err(format!("failed to resolve {s}: {e}")),
    }
}

pub fn resolve_to_socketaddr(host: &str, port: u16) -> std::io::Result<Vec<SocketAddr>> {
    let addrs: Vec<SocketAddr> = (host, port).to_socket_addrs()?.collect();
    if addrs.is_empty() {
        Err(std::io::Error::new(
            std::io::ErrorKind::AddrNotAvailable,
            format!("could not resolve {host}"),
        ))
    } else {
        Ok(addrs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Result<Config, clap::Error> {
        Config::from_args(std::iter::once("cowgate").chain(args.iter().copied()))
    }

    #[test]
    fn test_default_config() {
        let config = parse(&[]).unwrap();
        assert_eq!(config.listen_ip, "127.0.0.1".parse::<IpAddr>().unwrap());
        assert_eq!(config.ports, vec![7777]);
        assert!(!config.quiet);
        assert_eq!(config.log_level, "info");
        assert!(config.user_passwd.is_none());
        assert!(config.user_passwd_file.is_none());
        assert!(config.allowed_client.is_none());
        assert_eq!(config.auth_timeout, 2);
        assert!(config.bind_addr.is_none());
        assert!(!config.requires_auth());
    }

    #[test]
    fn test_custom_listen_ip_and_ports() {
        let config = parse(&["-i", "0.0.0.0", "-p", "3128,8080", "-p", "9000"]).unwrap();
        assert_eq!(config.ports, vec![3128, 8080, 9000]);
        let addrs = config.listen_addrs();
        assert_eq!(addrs.len(), 3);
        assert_eq!(addrs[0], "0.0.0.0:3128".parse::<SocketAddr>().unwrap());
    }

    #[test]
    fn test_ipv6_listen_addr() {
        let config = parse(&["-i", "::1", "-p", "3128"]).unwrap();
        assert_eq!(config.listen_addrs()[0], "[::1]:3128".parse::<SocketAddr>().unwrap());
    }

    #[test]
    fn test_user_passwd_enables_auth() {
        let config = parse(&["-u", "alice:secret:3128"]).unwrap();
        assert_eq!(config.user_passwd.as_deref(), Some("alice:secret:3128"));
        assert!(config.requires_auth());
    }

    #[test]
    fn test_user_passwd_file_enables_auth() {
        let config = parse(&["--user-passwd-file", "/etc/cowgate/users"]).unwrap();
        assert!(config.requires_auth());
    }

    #[test]
    fn test_allowed_client_enables_auth() {
        let config = parse(&["-w", "127.0.0.1,10.0.0.0/8"]).unwrap();
        assert_eq!(config.allowed_client.as_deref(), Some("127.0.0.1,10.0.0.0/8"));
        assert!(config.requires_auth());
    }

    #[test]
    fn test_empty_values_are_absent() {
        let config = parse(&["-u", "", "-f", "", "-w", ""]).unwrap();
        assert!(config.user_passwd.is_none());
        assert!(config.user_passwd_file.is_none());
        assert!(config.allowed_client.is_none());
        assert!(!config.requires_auth());
    }

    #[test]
    fn test_auth_timeout() {
        let config = parse(&["-t", "12"]).unwrap();
        assert_eq!(config.auth_timeout, 12);
    }

    #[test]
    fn test_quiet_mode() {
        let config = parse(&["-q"]).unwrap();
        assert!(config.quiet);
    }

    #[test]
    fn test_bind_addr() {
        let config = parse(&["-b", "192.168.1.1"]).unwrap();
        assert_eq!(config.bind_addr, Some("192.168.1.1".parse::<IpAddr>().unwrap()));
    }

    #[test]
    fn test_invalid_port() {
        assert!(parse(&["-p", "notanumber"]).is_err());
        assert!(parse(&["-p", "70000"]).is_err());
    }

    #[test]
    fn test_missing_option_arg() {
        assert!(parse(&["-u"]).is_err());
    }

    #[test]
    fn test_unknown_option() {
        assert!(parse(&["-Z"]).is_err());
    }

    #[test]
    fn test_resolve_ip_v4() {
        let ip = resolve_ip("127.0.0.1").unwrap();
        assert_eq!(ip, "127.0.0.1".parse::<IpAddr>().unwrap());
    }

    #[test]
    fn test_resolve_ip_v6() {
        let ip = resolve_ip("::1").unwrap();
        assert_eq!(ip, "::1".parse::<IpAddr>().unwrap());
    }

    #[test]
    fn test_resolve_to_socketaddr() {
        let addrs = resolve_to_socketaddr("127.0.0.1", 80).unwrap();
        assert_eq!(addrs, vec!["127.0.0.1:80".parse::<SocketAddr>().unwrap()]);
    }
}
