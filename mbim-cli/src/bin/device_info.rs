use mbim_lib::{LoggingInterface, State, Umb, UsbTransport};
use std::time::Duration;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .init();

    println!("Opening first MBIM function...");
    let (transport, config) = UsbTransport::open_first().await?;
    println!("Opened: {:?}\n", config);

    let umb = Umb::attach(transport, LoggingInterface::new(), config);
    umb.up().await?;

    // Device caps arrive while the session is in the open state; the SIM
    // identity once it has reached SIM ready
    println!("Waiting for the modem...");
    let reached = tokio::time::timeout(Duration::from_secs(15), umb.wait_for_state(State::SimReady)).await;
    if reached.is_err() {
        println!("  SIM not ready, showing what is known so far");
    }
    let info = umb.snapshot().info;

    println!("\n============================================================");
    println!("DEVICE INFORMATION");
    println!("============================================================");
    println!("Device ID:          {}", info.device_id);
    println!("Firmware:           {}", info.firmware_info);
    println!("Hardware:           {}", info.hardware_info);
    println!("Data classes:       {}", info.supported_classes);
    println!();
    println!("SIM state:          {}", info.sim_state);
    println!("PIN state:          {}", info.pin_state);
    println!("Subscriber ID:      {}", info.subscriber_id);
    println!("ICCID:              {}", info.iccid);
    println!("Phone number:       {}", info.phone_number);
    println!();
    println!("Radio:              hw {} sw {}", on_off(info.hw_radio_on), on_off(info.sw_radio_on));
    println!("Registration:       {} ({})", info.register_state, info.provider);

    umb.detach().await;
    Ok(())
}

fn on_off(on: bool) -> &'static str {
    if on { "on" } else { "off" }
}
