use modbusd::prelude::*;
use tracing::info;

fn main() -> std::result::Result<(), Box<dyn std::error::Error>> {
    modbusd::configure_logger(modbusd::LevelFilter::Info);
    let mut config = Config::default();
    config.memory.hr_count = 16;
    config.memory.coil_count = 8;
    config.memory.ir_count = 4;
    let addr = config.modbus.listen_addr();
    let driver = Driver::new(config);
    if !driver.start() {
        return Err("the driver failed to start".into());
    }
    info!(%addr, "driver started");
    // feed a simulated counter into the input register 0 (i0), report the status now and
    // then, stop after a minute
    for counter in 1..=30_u16 {
        std::thread::sleep(Duration::from_secs(2));
        driver.simulate(Area::Input, 0, i32::from(counter))?;
        if counter % 5 == 0 {
            let status = driver.status();
            info!(
                running = status.running,
                uptime = status.uptime.unwrap_or_default(),
                clients = status.connections.len(),
                "status"
            );
        }
    }
    driver.stop();
    info!("exiting");
    Ok(())
}
