//! Mock serve executable for integration testing
//!
//! Invoked as `mock-serve serve --port <N> --hostname <addr> [--model <name>]`.
//!
//! Environment variables:
//! - STARTUP_DELAY_MS: Delay before accepting connections (default: 0)
//! - EXIT_AFTER_MS: Exit with code 1 after this long (optional)

use std::env;
use std::sync::OnceLock;
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

/// Process start time for uptime tracking
static START_TIME: OnceLock<Instant> = OnceLock::new();

/// Model passed via --model
static MODEL: OnceLock<String> = OnceLock::new();

fn get_uptime() -> Duration {
    START_TIME.get().map(|t| t.elapsed()).unwrap_or_default()
}

struct Args {
    port: u16,
    hostname: String,
    model: Option<String>,
}

fn parse_args() -> Result<Args, String> {
    let mut args = env::args().skip(1);
    match args.next().as_deref() {
        Some("serve") => {}
        other => return Err(format!("expected 'serve' subcommand, got {:?}", other)),
    }

    let mut port = None;
    let mut hostname = "127.0.0.1".to_string();
    let mut model = None;

    while let Some(flag) = args.next() {
        let value = args
            .next()
            .ok_or_else(|| format!("missing value for {}", flag))?;
        match flag.as_str() {
            "--port" => port = Some(value.parse().map_err(|_| format!("invalid port: {}", value))?),
            "--hostname" => hostname = value,
            "--model" => model = Some(value),
            _ => return Err(format!("unknown flag: {}", flag)),
        }
    }

    Ok(Args {
        port: port.ok_or("--port is required")?,
        hostname,
        model,
    })
}

#[tokio::main]
async fn main() {
    START_TIME.set(Instant::now()).ok();

    let args = match parse_args() {
        Ok(args) => args,
        Err(e) => {
            eprintln!("Mock serve: {}", e);
            std::process::exit(2);
        }
    };
    if let Some(model) = args.model {
        MODEL.set(model).ok();
    }

    let startup_delay: u64 = env::var("STARTUP_DELAY_MS")
        .unwrap_or_else(|_| "0".to_string())
        .parse()
        .unwrap_or(0);

    if let Some(exit_after) = env::var("EXIT_AFTER_MS").ok().and_then(|v| v.parse::<u64>().ok()) {
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(exit_after)).await;
            eprintln!("Mock serve: exiting after {}ms", exit_after);
            std::process::exit(1);
        });
    }

    // Simulate startup delay
    if startup_delay > 0 {
        eprintln!("Mock serve: sleeping for {}ms before starting", startup_delay);
        tokio::time::sleep(Duration::from_millis(startup_delay)).await;
    }

    let listener = TcpListener::bind((args.hostname.as_str(), args.port))
        .await
        .expect("Failed to bind");

    println!("Mock serve: listening on {}:{}", args.hostname, args.port);

    loop {
        match listener.accept().await {
            Ok((stream, _)) => {
                tokio::spawn(async move {
                    handle_connection(stream).await;
                });
            }
            Err(e) => {
                eprintln!("Mock serve: accept error: {}", e);
            }
        }
    }
}

async fn handle_connection(mut stream: tokio::net::TcpStream) {
    let mut buf = Vec::new();
    let mut temp = [0u8; 1024];

    // Read HTTP request headers
    loop {
        let n = match stream.read(&mut temp).await {
            Ok(0) => return,
            Ok(n) => n,
            Err(_) => return,
        };
        buf.extend_from_slice(&temp[..n]);

        if buf.windows(4).any(|w| w == b"\r\n\r\n") {
            break;
        }
        if buf.len() > 8192 {
            return;
        }
    }

    let request_str = match std::str::from_utf8(&buf) {
        Ok(s) => s,
        Err(_) => return,
    };

    let path = request_str
        .lines()
        .next()
        .and_then(|line| line.split(' ').nth(1))
        .unwrap_or("/");

    let (status, body) = match path {
        "/session" => ("200 OK", "[]".to_string()),
        "/model" => (
            "200 OK",
            MODEL.get().cloned().unwrap_or_else(|| "none".to_string()),
        ),
        "/error" => ("500 Internal Server Error", "error".to_string()),
        _ => (
            "200 OK",
            format!("Hello! Uptime: {:.1}s", get_uptime().as_secs_f64()),
        ),
    };

    let response = format!(
        "HTTP/1.1 {}\r\n\
         Content-Type: text/plain\r\n\
         Content-Length: {}\r\n\
         Connection: close\r\n\
         \r\n\
         {}",
        status,
        body.len(),
        body
    );

    let _ = stream.write_all(response.as_bytes()).await;
}
