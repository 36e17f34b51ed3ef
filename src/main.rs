use std::process::exit;
use std::thread;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;

use sensorbridge::{logging, transport::DeviceAddress, Session};

#[derive(Parser, Debug)]
#[command(
    name = "sensorbridge-demo",
    about = "Connect to a biosignal acquisition device and print a few batches of samples"
)]
struct Args {
    /// Device address: a Bluetooth MAC (20:16:10:XX:XX:XX) or a serial path (/dev/rfcomm0)
    device: String,
    /// Sampling rate in Hz (1, 10, 100 or 1000)
    #[arg(long, default_value_t = 1000)]
    rate: u16,
    /// Analog channels to acquire, 0-indexed
    #[arg(long, value_delimiter = ',', default_value = "0,1,2,3,4,5")]
    channels: Vec<u8>,
    /// Number of 100-sample batches to print before stopping
    #[arg(long, default_value_t = 10)]
    batches: usize,
}

fn main() {
    logging::init_rust_logging();
    if let Err(e) = run() {
        eprintln!("Error: {e}");
        exit(1);
    }
}

fn run() -> Result<()> {
    let args = Args::parse();

    println!("--- connecting to {} ---", args.device);
    let address = DeviceAddress::parse(&args.device)?;
    let transport = sensorbridge::open_transport(&address)?;
    let mut session = Session::new(transport);

    let version = session.open()?;
    println!("connected: version={}", version.raw);

    println!("starting acquisition at {}Hz on {:?}", args.rate, args.channels);
    session.start(args.rate, &args.channels)?;

    println!("reading {} batches of 100 samples...", args.batches);
    for i in 0..args.batches {
        match session.read(100) {
            Ok(batch) => {
                if let Some(first) = batch.first() {
                    println!(
                        "[batch {i}] seq={:02} analog={:?}",
                        first.seq, first.analog
                    );
                }
            }
            Err(e) => eprintln!("read error: {e}"),
        }
        thread::sleep(Duration::from_millis(10));
    }

    println!("stopping...");
    session.stop()?;
    session.close()?;
    println!("done.");
    Ok(())
}
