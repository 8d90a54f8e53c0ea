use std::io;
use std::sync::Arc;

use clap::Parser;
use relay::{BatchLimits, MemorySourceFactory, Server, StreamStats, StreamingScheduler};

#[derive(Parser)]
#[command(
    name = "relay-server",
    about = "RTSP relay serving a synthetic H.264-shaped stream over interleaved TCP"
)]
struct Args {
    /// Bind address (host:port)
    #[arg(long, short, default_value = "0.0.0.0:8554")]
    bind: String,

    /// Number of frames in the synthetic stream
    #[arg(long, default_value_t = 250)]
    frames: usize,

    /// Frame rate of the synthetic stream
    #[arg(long, default_value_t = 25)]
    fps: u32,

    /// Payload bytes per frame
    #[arg(long, default_value_t = 1200)]
    payload: usize,

    /// Restart the stream from the beginning when it ends
    #[arg(long, default_value_t = true)]
    looping: bool,
}

fn main() {
    tracing_subscriber::fmt::init();

    let args = Args::parse();

    let factory = MemorySourceFactory::synthetic(args.frames, args.fps, args.payload);
    let scheduler = Arc::new(StreamingScheduler::new(
        Box::new(factory),
        BatchLimits::default(),
        args.looping,
        Arc::new(StreamStats::new()),
    ));

    let mut server = Server::new(&args.bind, scheduler.clone());
    if let Err(e) = server.start() {
        eprintln!("Failed to start server: {}", e);
        return;
    }

    println!("RTSP relay on {} — press Enter to stop", args.bind);
    let mut input = String::new();
    io::stdin().read_line(&mut input).unwrap();

    server.stop();

    let stats = scheduler.stats();
    println!(
        "delivered {} bits, accumulated lag {} ms",
        stats.throughput_bits(),
        stats.lag_ms()
    );
}
