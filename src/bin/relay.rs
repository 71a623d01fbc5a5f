// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 udprelay contributors
//
// Command-line entry point. Syntax mirrors the relay's historical ABI:
//
//   relay <peer> <base UDP port> target|<forward target> [<TCP port>]
//
// Both relay ends run this same binary; only the mode argument differs.

use std::net::{SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::os::unix::io::IntoRawFd;
use std::process::ExitCode;
use std::sync::Arc;
use std::thread;

use tracing::{error, info};

use udprelay::channel::ChannelState;
use udprelay::consts::{exit_code, RELAY_SERVER_PORT, WEB_SERVER_PORT};
use udprelay::endpoint::{Endpoint, RelayMode};
use udprelay::error::RelayPanic;
use udprelay::workers::{tcp_helper, tcp_receiver, tcp_sender, udp_demux};

fn usage(exec_name: &str) {
    eprintln!(
        "syntax: {exec_name} <peer> <base UDP port> target|<forward target> [<TCP port>]"
    );
    eprintln!(
        "   (TCP port defaults to {RELAY_SERVER_PORT} for target, {WEB_SERVER_PORT} for forwarding target)"
    );
}

fn resolve(host: &str, port: u16) -> std::io::Result<SocketAddr> {
    (host, port)
        .to_socket_addrs()?
        .next()
        .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::NotFound, "no address found"))
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args: Vec<String> = std::env::args().collect();
    if args.len() < 4 || args.len() > 5 {
        usage(&args[0]);
        return ExitCode::from(exit_code::PARSE_OPTS as u8);
    }

    let base_port: u16 = match args[2].parse() {
        Ok(p) => p,
        Err(_) => {
            usage(&args[0]);
            return ExitCode::from(exit_code::PARSE_OPTS as u8);
        }
    };

    let (mode, tcp_port, fwd_addr, target_listener) = if args[3] == "target" {
        let tcp_port = args.get(4).and_then(|s| s.parse().ok()).unwrap_or(RELAY_SERVER_PORT);
        let listener = match TcpListener::bind(("0.0.0.0", tcp_port)) {
            Ok(l) => l,
            Err(e) => {
                error!(error = %e, "failed to bind target socket");
                return ExitCode::from(exit_code::PANIC as u8);
            }
        };
        (RelayMode::Target, tcp_port, None, Some(listener))
    } else {
        let tcp_port = args.get(4).and_then(|s| s.parse().ok()).unwrap_or(WEB_SERVER_PORT);
        let fwd = match resolve(&args[3], tcp_port) {
            Ok(a) => a,
            Err(e) => {
                eprintln!("forwarding target \"{}\" unknown: {e}", args[3]);
                usage(&args[0]);
                return ExitCode::from(exit_code::PARSE_OPTS as u8);
            }
        };
        (RelayMode::Forward, tcp_port, Some(fwd), None)
    };

    let peer_addr = match resolve(&args[1], base_port) {
        Ok(a) => a,
        Err(e) => {
            eprintln!("peer \"{}\" unknown: {e}", args[1]);
            usage(&args[0]);
            return ExitCode::from(exit_code::PARSE_OPTS as u8);
        }
    };

    let endpoint = match Endpoint::bind(base_port, peer_addr, mode, fwd_addr) {
        Ok(e) => Arc::new(e),
        Err(e) => {
            error!(error = %e, "endpoint setup failed");
            return ExitCode::from(exit_code::PANIC as u8);
        }
    };

    info!(?mode, tcp_port, "starting relay");
    spawn_channel_workers(&endpoint);

    match mode {
        RelayMode::Forward => {
            // The forward side has no accept loop: every channel's
            // receiver thread opens its own TCP connection on demand.
            thread::park();
            ExitCode::from(exit_code::NORMAL as u8)
        }
        RelayMode::Target => run_accept_loop(&endpoint, target_listener.unwrap()),
    }
}

fn spawn_channel_workers(endpoint: &Arc<Endpoint>) {
    {
        let endpoint = Arc::clone(endpoint);
        thread::spawn(move || {
            if let Err(e) = udp_demux(&endpoint) {
                error!(error = %e, "udp demultiplexer exited");
                std::process::exit(exit_code::PANIC);
            }
        });
    }

    for index in 0..endpoint.table.channels.len() {
        {
            let endpoint = Arc::clone(endpoint);
            thread::spawn(move || {
                let ct = &endpoint.table.channels[index];
                if let Err(e) = tcp_helper(ct, &endpoint) {
                    error!(channel = index, error = %e, "tcp helper exited");
                    std::process::exit(exit_code::PANIC);
                }
            });
        }
        {
            let endpoint = Arc::clone(endpoint);
            thread::spawn(move || {
                let ct = &endpoint.table.channels[index];
                if let Err(e) = tcp_sender(ct, &endpoint) {
                    error!(channel = index, error = %e, "tcp sender exited");
                    std::process::exit(exit_code::PANIC);
                }
            });
        }
        {
            let endpoint = Arc::clone(endpoint);
            thread::spawn(move || {
                let ct = &endpoint.table.channels[index];
                if let Err(e) = tcp_receiver(ct, &endpoint) {
                    error!(channel = index, error = %e, "tcp receiver exited");
                    std::process::exit(exit_code::PANIC);
                }
            });
        }
    }
}

fn run_accept_loop(endpoint: &Arc<Endpoint>, listener: TcpListener) -> ExitCode {
    loop {
        let stream: TcpStream = match listener.accept() {
            Ok((s, _)) => s,
            Err(e) => {
                error!(error = %e, "accept failed");
                return ExitCode::from(exit_code::PANIC as u8);
            }
        };

        endpoint.table.free_slots.acquire();
        let fd = stream.into_raw_fd();
        match endpoint.table.bind_inactive(fd) {
            Some(ct) => {
                info!(channel = ct.number, "accepted connection");
                ct.wake_all_except(ChannelState::NONE);
            }
            None => {
                let panic = RelayPanic::Impossible(
                    "no inactive channel found despite an available permit".to_string(),
                );
                error!(error = %panic, "accept-path invariant violated");
                // Safety: `fd` was just produced by `into_raw_fd` and has
                // not been handed to any channel.
                unsafe {
                    libc::close(fd);
                }
                return ExitCode::from(exit_code::PANIC as u8);
            }
        }
    }
}
