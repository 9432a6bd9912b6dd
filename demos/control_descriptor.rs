//! Read the device descriptor of the device at the given bus number and
//! address, e.g. `control_descriptor 1 4`.

#[cfg(any(target_os = "linux", target_os = "android"))]
fn main() {
    use std::time::Duration;

    use usb_async::{
        platform::LinuxDevice,
        transfer::{ControlBuffer, ControlType, Recipient, TransferOptions},
        Completion, ControlIn, ExecutionContext,
    };

    env_logger::init();
    let mut args = std::env::args().skip(1).map(|a| a.parse::<u8>());
    let (Some(Ok(bus)), Some(Ok(addr))) = (args.next(), args.next()) else {
        eprintln!("usage: control_descriptor <bus> <address>");
        std::process::exit(2);
    };

    let device = LinuxDevice::open(bus, addr).expect("failed to open device");
    let ctx = ExecutionContext::new();

    let options = TransferOptions::new().timeout(Duration::from_millis(500));
    let mut transfer = ControlIn::new(&ctx.executor(), &device, options).unwrap();
    let buffer = transfer.allocate_control_buffer(18).unwrap();

    transfer.async_control(
        Recipient::Device,
        ControlType::Standard,
        0x06,   // GET_DESCRIPTOR
        0x0100, // device descriptor, index 0
        0,
        buffer,
        |c: Completion<usize, ControlBuffer>| match c.status {
            Ok(()) => println!("device descriptor: {:02x?}", &c.buffer[..c.result]),
            Err(e) => println!("GET_DESCRIPTOR failed: {e}"),
        },
    );

    ctx.run();
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
fn main() {
    eprintln!("no native backend on this platform");
}
