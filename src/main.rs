use std::env;

use anyhow::{bail, Result};
use log::error;

mod follow;
mod notify;
mod scan;
mod tracker;

use follow::{FollowOptions, FollowSession, WatchedFile};

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();

    let mut opts = FollowOptions::default();
    let mut operands: Vec<String> = Vec::new();
    let mut args = env::args().skip(1);
    while let Some(a) = args.next() {
        match a.as_str() {
            "-f" | "--follow" => opts.follow = true,
            "-F" => {
                opts.follow = true;
                opts.retry = true;
            }
            "--retry" => opts.retry = true,
            "-n" | "--lines" => {
                let v = args
                    .next()
                    .ok_or_else(|| anyhow::anyhow!("missing value after -n"))?;
                opts.lines = v
                    .parse()
                    .map_err(|_| anyhow::anyhow!("invalid line count: {v}"))?;
            }
            "-s" | "--sleep-interval" => {
                let v = args
                    .next()
                    .ok_or_else(|| anyhow::anyhow!("missing value after -s"))?;
                let secs: f64 = v
                    .parse()
                    .map_err(|_| anyhow::anyhow!("invalid interval: {v}"))?;
                if !secs.is_finite() || secs <= 0.0 {
                    bail!("invalid interval: {v}");
                }
                opts.interval = std::time::Duration::from_secs_f64(secs);
            }
            "-q" | "--quiet" | "--silent" => opts.quiet = true,
            "-v" | "--verbose" => opts.verbose = true,
            "--poll" => opts.force_poll = true,
            "-" => operands.push(String::from("-")),
            other if other.starts_with('-') => bail!("unknown argument: {other}"),
            other => operands.push(other.to_string()),
        }
    }

    let mut failed = false;
    let mut files: Vec<WatchedFile> = Vec::new();
    if operands.is_empty() {
        files.push(WatchedFile::stdin()?);
    } else {
        for op in &operands {
            if op == "-" {
                files.push(WatchedFile::stdin()?);
                continue;
            }
            match WatchedFile::from_path(op) {
                Ok(wf) => files.push(wf),
                Err(e) => {
                    error!("cannot open '{op}' for reading: {e}");
                    if opts.retry {
                        files.push(WatchedFile::missing(op));
                    } else {
                        failed = true;
                    }
                }
            }
        }
    }
    if files.is_empty() {
        std::process::exit(1);
    }

    let follow = opts.follow;
    let mut session = FollowSession::new(files, opts);
    let mut out = std::io::stdout();
    session.seed(&mut out)?;
    if follow {
        session.run(&mut out)?;
    }
    if failed {
        std::process::exit(1);
    }
    Ok(())
}
