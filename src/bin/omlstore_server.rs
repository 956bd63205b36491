use std::{
    collections::HashMap,
    error::Error,
    net::SocketAddr,
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};

use clap::Parser;
use log::{error, info, warn};
use omlstore::{
    Endpoint, Scheduler, Table, TableOptions,
    protocol::Stream,
};

type Tables = Arc<Mutex<HashMap<String, Table>>>;

#[derive(Debug, Parser)]
#[command(version, about, long_about = None)]
struct Cli {
    /// Listen for OML clients at address
    #[arg(env = "OMLSTORE_ADDRESS", default_value = "0.0.0.0:3003")]
    address: SocketAddr,
    /// Rows kept per stream table; older rows are evicted
    #[arg(long, env = "OMLSTORE_MAX_ROWS", default_value_t = 1000)]
    max_rows: usize,
    /// Worker threads for background jobs
    #[arg(long, default_value_t = 2)]
    workers: usize,
    /// Seconds between table summaries in the log
    #[arg(long, default_value_t = 60)]
    report_every: u64,
}

fn main() -> Result<(), Box<dyn Error>> {
    env_logger::init();

    let cli = Cli::parse();
    let scheduler = Scheduler::new(cli.workers)?;
    let tables = Tables::default();

    let endpoint = Endpoint::bind(cli.address)?;
    let registry = tables.clone();
    let max_rows = cli.max_rows;
    endpoint.on_new_stream("tables", move |name: &str, stream: &Stream| {
        match stream.create_table(name, TableOptions::default().with_max_size(max_rows)) {
            Ok(table) => {
                info!("stream '{name}' stored in table ({})", table.schema());
                registry
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .insert(name.to_string(), table);
            }
            Err(e) => error!("cannot create table for stream '{name}': {e}"),
        }
    });

    let (handle, listener) = endpoint.spawn()?;
    let stopper = handle.clone();
    ctrlc::set_handler(move || {
        info!("shutting down");
        stopper.stop();
    })?;

    report(&scheduler, tables, Duration::from_secs(cli.report_every.max(1)));

    listener.join().map_err(|_| "listener thread panicked")??;
    Ok(())
}

fn report(scheduler: &Scheduler, tables: Tables, every: Duration) {
    let next = scheduler.clone();
    let scheduled = scheduler.execute_after(every, move || {
        {
            let tables = tables.lock().unwrap_or_else(PoisonError::into_inner);
            for (name, table) in tables.iter() {
                info!("[{name}] {} row(s), {} evicted", table.len(), table.offset());
            }
        }
        report(&next, tables, every);
    });
    if let Err(e) = scheduled {
        warn!("cannot schedule table summary: {e}");
    }
}
