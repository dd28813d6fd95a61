// Copyright 2024 dshield developers
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <http://www.gnu.org/licenses/>.

mod control;
mod worker;

use self::worker::worker;
use anyhow::{Context, Result};
use bytes::Bytes;
use dfilter::{AsyncTryInto, FilterBuilder, FilterConfig};
use log::*;
use simple_logger::SimpleLogger;
use std::{net::SocketAddr, path::PathBuf, sync::Arc};
use structopt::StructOpt;
use tokio::net::UdpSocket;

#[derive(StructOpt)]
#[structopt(name = "dshield", about = "Host-resident DNS filtering proxy.")]
struct Args {
    /// Path to the YAML configuration file.
    #[structopt(short, long, parse(from_os_str))]
    config: Option<PathBuf>,

    /// Address to serve DNS on.
    #[structopt(short, long, default_value = "127.0.0.1:5300")]
    listen: SocketAddr,

    /// Unix socket path for control commands.
    #[structopt(long, parse(from_os_str))]
    control_socket: Option<PathBuf>,

    /// Validate the configuration and exit.
    #[structopt(long)]
    check: bool,
}

async fn load_config(path: Option<&PathBuf>) -> Result<FilterConfig> {
    let config = match path {
        Some(path) => {
            let raw = tokio::fs::read_to_string(path)
                .await
                .with_context(|| format!("reading {}", path.display()))?;
            serde_yaml::from_str(&raw).with_context(|| format!("parsing {}", path.display()))?
        }
        None => FilterConfig::default(),
    };
    Ok(config)
}

fn level_from(config: &FilterConfig) -> LevelFilter {
    if config.debug_logging {
        return LevelFilter::Debug;
    }
    match config.verbosity.as_str() {
        "off" => LevelFilter::Off,
        "error" => LevelFilter::Error,
        "warn" => LevelFilter::Warn,
        "debug" => LevelFilter::Debug,
        "trace" => LevelFilter::Trace,
        _ => LevelFilter::Info,
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::from_args();
    let config = load_config(args.config.as_ref()).await?;

    SimpleLogger::new().with_level(level_from(&config)).init()?;

    if args.check {
        config.validate()?;
        println!("configuration ok");
        return Ok(());
    }

    let filter = FilterBuilder::new(config).async_try_into().await?;
    info!("dshield ready!");

    if let Some(path) = &args.control_socket {
        control::serve(filter.clone(), path.clone(), args.config.clone());
    }

    // Reload the configuration file on SIGHUP.
    #[cfg(unix)]
    {
        let filter = filter.clone();
        let config_path = args.config.clone();
        tokio::spawn(async move {
            let mut hup = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::hangup())
            {
                Ok(hup) => hup,
                Err(e) => {
                    warn!("cannot listen for SIGHUP: {}", e);
                    return;
                }
            };
            while hup.recv().await.is_some() {
                info!("SIGHUP: reloading configuration");
                match load_config(config_path.as_ref()).await {
                    Ok(config) => {
                        if let Err(e) = filter.reload(config).await {
                            error!("reload failed: {}", e);
                        }
                    }
                    Err(e) => error!("reload failed: {}", e),
                }
            }
        });
    }

    let socket = Arc::new(UdpSocket::bind(args.listen).await?);
    info!("serving DNS on {}", args.listen);

    let serve = {
        let filter = filter.clone();
        let socket = socket.clone();
        async move {
            loop {
                let mut buf = vec![0u8; 1232];
                let (len, src) = match socket.recv_from(&mut buf).await {
                    Ok(received) => received,
                    Err(e) => {
                        warn!("recv failed: {}", e);
                        continue;
                    }
                };
                buf.truncate(len);

                let filter = filter.clone();
                let socket = socket.clone();
                tokio::spawn(async move {
                    match worker(filter, socket, Bytes::from(buf), src).await {
                        Ok(_) => (),
                        Err(e) => warn!("Handling query failed: {}", e),
                    }
                });
            }
        }
    };

    tokio::select! {
        _ = serve => {}
        _ = tokio::signal::ctrl_c() => {
            info!("shutting down");
        }
    }
    filter.shutdown();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::{level_from, load_config};
    use dfilter::FilterConfig;
    use log::LevelFilter;
    use std::io::Write;
    use tokio_test::block_on;

    #[test]
    fn default_config_when_no_file() {
        let config = block_on(load_config(None)).unwrap();
        config.validate().unwrap();
    }

    #[test]
    fn yaml_file_roundtrip() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "upstream_dns_servers: ['9.9.9.9']\nblocked_ttl: 30\nverbosity: debug"
        )
        .unwrap();
        let path = file.path().to_path_buf();
        let config = block_on(load_config(Some(&path))).unwrap();
        assert_eq!(config.blocked_ttl, 30);
        assert_eq!(level_from(&config), LevelFilter::Debug);
    }

    #[test]
    fn bad_yaml_is_an_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "upstream_dns_servers: [unclosed").unwrap();
        let path = file.path().to_path_buf();
        assert!(block_on(load_config(Some(&path))).is_err());
    }

    #[test]
    fn verbosity_mapping() {
        let mut config = FilterConfig::default();
        assert_eq!(level_from(&config), LevelFilter::Info);
        config.verbosity = "warn".into();
        assert_eq!(level_from(&config), LevelFilter::Warn);
        config.debug_logging = true;
        assert_eq!(level_from(&config), LevelFilter::Debug);
    }
}
