//! Bus monitor
//!
//! Connects to the first GS-USB adapter, prints every received frame and
//! sends a heartbeat once per second:
//! - classic CAN at 500 kbit/s by default,
//! - CAN FD at 500 kbit/s / 2 Mbit/s when started with `--fd`.

use std::thread;
use std::time::Duration;

use can_manager::{CanManager, Continuation, Frame, GsUsbTransport};

fn main() {
    // Initialize logging
    env_logger::init();

    if let Err(e) = run() {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

fn run() -> can_manager::Result<()> {
    let fd = std::env::args().any(|arg| arg == "--fd");
    let manager = CanManager::new(GsUsbTransport::new());

    let channels = manager.available_channels()?;
    let channel = match channels.first() {
        Some(&channel) => channel,
        None => {
            println!("Can not find gs_usb device");
            return Ok(());
        }
    };
    println!("Found channel {}", channel);

    let events = manager.subscribe_connection_events();
    if fd {
        manager.connect_fd(channel, 500_000, 2_000_000)?;
    } else {
        manager.connect(channel, 500_000)?;
    }
    if let Ok(event) = events.try_recv() {
        println!("{:?}", event);
    }

    manager.add_receive_callback(|frame, timestamp| {
        println!("{:>12.6}  RX  {}", timestamp.as_secs_f64(), frame);
        Continuation::Continue
    });

    println!("\nMonitoring (press Ctrl+C to stop)...\n");

    let mut counter = 0u8;
    loop {
        let heartbeat = if fd {
            Frame::new(0x7FF, &[counter; 12])?
        } else {
            Frame::new(0x7FF, &[counter])?
        };
        let sent = if fd {
            manager.send_fd(&heartbeat)
        } else {
            manager.send_classic(&heartbeat)
        };
        match sent {
            Ok(()) => println!("              TX  {}", heartbeat),
            Err(e) => eprintln!("TX failed: {}", e),
        }
        counter = counter.wrapping_add(1);
        thread::sleep(Duration::from_secs(1));
    }
}
