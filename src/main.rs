/*
   cowgate - forward HTTP proxy with proxy authentication.

   Features:
   - HTTP Digest (RFC 2617, qop=auth) and Basic proxy authentication
   - Multiple users from the command line or a credential file
   - Per-user listening port restriction
   - IPv4 client allowlist that skips authentication
   - Auth-once cache of client IPs with a configurable lifetime
   - CONNECT tunnels and absolute-form HTTP forwarding
*/

mod allowlist;
mod auth;
mod config;
mod digest;
mod error;
mod http;
mod logging;
mod proxy;
mod timeout_set;
mod users;

use auth::Auth;
use config::Config;
use proxy::run_server;
use std::process;
use std::sync::Arc;

fn main() {
    let config = match Config::from_args(std::env::args_os()) {
        Ok(c) => c,
        Err(e) => e.exit(),
    };

    logging::init(config.quiet, &config.log_level);

    let auth = match Auth::from_config(&config) {
        Ok(a) => a,
        Err(e) => {
            eprintln!("error: {e}");
            process::exit(1);
        }
    };

    if let Err(e) = run_server(Arc::new(config), Arc::new(auth)) {
        eprintln!("error: {e}");
        process::exit(1);
    }
}
