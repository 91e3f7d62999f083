mod net;

use clap::Parser;
use mapperd_core::blocker::BlockerClient;
use mapperd_core::dispatcher::Dispatcher;
use mapperd_core::mapper::Mapper;
use spdlog::{Level, LevelFilter, info, warn};
use tokio::net::TcpListener;
use tokio::signal::unix::{SignalKind, signal};
use tokio::sync::mpsc;
use tokio::task::{LocalSet, spawn_local};
use tokio_util::sync::CancellationToken;

/// The volume mapper daemon: translates logical byte ranges of virtual
/// volumes into content-addressed backing objects, speaking to a data
/// blocker and a map blocker.
#[derive(Parser)]
#[command(name = "mapperd", version)]
struct Args {
    /// Port of the blocker serving data objects
    #[arg(long = "bp")]
    bport: u16,

    /// Port of the blocker serving map blobs
    #[arg(long = "mbp")]
    mbport: u16,

    /// Port to accept mapper requests on
    #[arg(long, default_value_t = 9762)]
    port: u16,

    /// Cap on in-flight sub-requests per operation
    #[arg(long = "nr-ops", default_value_t = 16)]
    nr_ops: u64,

    /// Log everything
    #[arg(short, long)]
    verbose: bool,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    spdlog::default_logger().set_level_filter(if args.verbose {
        LevelFilter::All
    } else {
        LevelFilter::MoreSevereEqual(Level::Info)
    });

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    // All mapper state is single-threaded; handlers run as cooperative
    // tasks on one local set.
    LocalSet::new().block_on(&runtime, run(args))
}

async fn run(args: Args) -> anyhow::Result<()> {
    let data = BlockerClient::new(net::connect_blocker(args.bport).await?);
    let mapb = BlockerClient::new(net::connect_blocker(args.mbport).await?);
    info!(
        "connected to data blocker on port {}, map blocker on port {}",
        args.bport, args.mbport
    );

    let mapper = Mapper::new(data, mapb, args.nr_ops);
    let dispatcher = Dispatcher::new(mapper);

    let listener = TcpListener::bind(("127.0.0.1", args.port)).await?;
    info!("mapperd listening on port {}", args.port);

    let cancel = CancellationToken::new();
    let cancel_signal = cancel.clone();
    spawn_local(async move {
        let mut sigterm = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
        tokio::select! {
            _ = sigterm.recv() => {}
            _ = tokio::signal::ctrl_c() => {}
        }
        info!("shutting down...");
        cancel_signal.cancel();
    });

    let (tx, rx) = mpsc::unbounded_channel();
    let cancel_accept = cancel.clone();
    spawn_local(async move {
        loop {
            tokio::select! {
                _ = cancel_accept.cancelled() => break,
                conn = listener.accept() => match conn {
                    Ok((stream, addr)) => {
                        spdlog::debug!("accepted connection from {}", addr);
                        net::serve_conn(stream, tx.clone(), cancel_accept.clone());
                    }
                    Err(e) => warn!("accept failed: {}", e),
                },
            }
        }
        // Dropping the feed lets the dispatcher drain and close every map.
    });

    dispatcher.run(rx).await;
    info!("mapperd exiting");
    Ok(())
}
