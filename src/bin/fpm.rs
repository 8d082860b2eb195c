// Copyright 2022 jmjoy
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! The `fpm` master binary: loads the configuration, applies CLI
//! overrides, and runs one master per pool section.

use anyhow::Result;
use clap::Parser;
use fastcgi_fpm::{EchoEngine, Master, ProcessManager, ServerConfig, net::ListenAddr};
use std::path::PathBuf;
use tracing_subscriber::FmtSubscriber;

#[derive(Debug, Parser)]
#[command(name = "fpm")]
#[command(about = "FastCGI process manager", long_about = None)]
struct Cli {
    /// Path to the configuration file
    #[arg(short = 'y', long = "fpm-config")]
    fpm_config: Option<PathBuf>,

    /// Listen address: host:port or an absolute socket path
    #[arg(long)]
    listen: Option<String>,

    /// Run in the foreground (the only supported mode)
    #[arg(long)]
    nodaemonize: bool,

    /// PID file path
    #[arg(long)]
    pid: Option<PathBuf>,

    /// Process management mode: static, dynamic or ondemand
    #[arg(long)]
    pm: Option<ProcessManager>,

    /// Max worker count
    #[arg(long = "pm-max-children")]
    pm_max_children: Option<usize>,

    /// Initial workers (dynamic)
    #[arg(long = "pm-start-servers")]
    pm_start_servers: Option<usize>,

    /// Lower idle threshold (dynamic)
    #[arg(long = "pm-min-spare-servers")]
    pm_min_spare_servers: Option<usize>,

    /// Upper idle threshold (dynamic)
    #[arg(long = "pm-max-spare-servers")]
    pm_max_spare_servers: Option<usize>,

    /// Recycle a worker after N requests (0 = unlimited)
    #[arg(long = "pm-max-requests")]
    pm_max_requests: Option<u64>,

    /// Validate the configuration and exit
    #[arg(short = 't', long = "test")]
    test: bool,
}

impl Cli {
    /// CLI flags override the file configuration; pool-level flags apply
    /// to the first pool.
    fn apply(&self, config: &mut ServerConfig) -> Result<()> {
        if let Some(pid) = &self.pid {
            config.global.pid = Some(pid.clone());
        }

        let pool = config
            .pools
            .first_mut()
            .ok_or_else(|| anyhow::anyhow!("no pool configured"))?;
        if let Some(listen) = &self.listen {
            pool.listen = listen.parse::<ListenAddr>()?;
        }
        if let Some(pm) = self.pm {
            pool.pm = pm;
        }
        if let Some(n) = self.pm_max_children {
            pool.max_children = n;
        }
        if let Some(n) = self.pm_start_servers {
            pool.start_servers = n;
        }
        if let Some(n) = self.pm_min_spare_servers {
            pool.min_spare_servers = n;
        }
        if let Some(n) = self.pm_max_spare_servers {
            pool.max_spare_servers = n;
        }
        if let Some(n) = self.pm_max_requests {
            pool.max_requests = n;
        }
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = match &cli.fpm_config {
        Some(path) => ServerConfig::load(path)?,
        None => ServerConfig::with_default_pool(),
    };
    cli.apply(&mut config)?;
    config.validate()?;

    if cli.test {
        println!("configuration test is successful");
        return Ok(());
    }

    let subscriber = FmtSubscriber::builder()
        .with_max_level(config.global.tracing_level())
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    // Daemonization is not implemented; the server always runs in the
    // foreground, which is what --nodaemonize asks for.
    let _ = cli.nodaemonize;
    let mut masters = Vec::new();
    for (index, pool) in config.pools.iter().enumerate() {
        let mut global = config.global.clone();
        if index > 0 {
            // The PID file belongs to the first master only.
            global.pid = None;
        }
        let master = Master::new(global, pool.clone(), EchoEngine::factory());
        master.start().await?;
        masters.push(master);
    }

    for master in &masters {
        master.wait().await;
    }
    Ok(())
}
