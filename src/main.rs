//! The sonord daemon.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::ExitCode;

use log::error;

use sonord::protocol::SampleSpec;
use sonord::server::{Config, Server};

fn usage() {
    eprintln!("usage: sonord [--socket PATH] [--tcp ADDR:PORT]");
}

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let mut socket_path = sonord::socket_path_from_env();
    let mut tcp_addr: Option<SocketAddr> = None;

    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--socket" => match args.next() {
                Some(path) => socket_path = Some(PathBuf::from(path)),
                None => {
                    usage();
                    return ExitCode::FAILURE;
                }
            },
            "--tcp" => match args.next().and_then(|a| a.parse().ok()) {
                Some(addr) => tcp_addr = Some(addr),
                None => {
                    usage();
                    return ExitCode::FAILURE;
                }
            },
            _ => {
                usage();
                return ExitCode::FAILURE;
            }
        }
    }

    let Some(socket_path) = socket_path else {
        error!("no socket path; set --socket, $SONORD_SERVER or $XDG_RUNTIME_DIR");
        return ExitCode::FAILURE;
    };

    let Some(cookie_path) = sonord::cookie_path_from_env() else {
        error!("no cookie path; set $SONORD_COOKIE or $HOME");
        return ExitCode::FAILURE;
    };

    let config = Config {
        socket_path: Some(socket_path),
        tcp_addr,
        cookie_path,
        sample_spec: SampleSpec::default(),
    };

    let mut server = match Server::new(config) {
        Ok(server) => server,
        Err(e) => {
            error!("failed to start: {}", e);
            return ExitCode::FAILURE;
        }
    };

    match server.run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("fatal: {}", e);
            ExitCode::FAILURE
        }
    }
}
