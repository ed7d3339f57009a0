//! Stream an HTTP response body through a fiber
//!
//! Usage: fetch <url>
//!
//! Runs a cord on the main thread, issues a streaming GET, and copies the
//! body to stdout chunk by chunk while the transport is driven by the
//! cord's event loop.

use std::io::Write;

use strand::cord::Cord;
use strand::HttpEnv;

fn main() {
    let url = match std::env::args().nth(1) {
        Some(url) => url,
        None => {
            eprintln!("usage: fetch <url>");
            std::process::exit(2);
        }
    };

    let status = Cord::run("fetch", move || {
        let env = HttpEnv::new(8, 8)?;
        let req = env.request("GET", &url)?;
        req.set_io("GET")?;
        req.start(10.0)?;

        let mut total = 0usize;
        let mut buf = [0u8; 8192];
        let stdout = std::io::stdout();
        let mut out = stdout.lock();
        loop {
            let n = req.io_read(&mut buf, 10.0)?;
            if n == 0 {
                break;
            }
            total += n;
            let _ = out.write_all(&buf[..n]);
        }
        req.io_finish(10.0)?;

        eprintln!("{} {} ({} bytes)", req.status(), req.reason(), total);
        Ok(if req.status() == 200 { 0 } else { 1 })
    });

    match status {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            eprintln!("fetch failed: {}", e);
            std::process::exit(1);
        }
    }
}
