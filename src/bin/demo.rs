//! Modbus IP Demo
//!
//! Runs a slave and a master on localhost and walks through one exchange:
//! - A slave with a small register/coil core, served by the polling loop
//! - A master writing a holding register (FC06) and a coil (FC05)
//! - Reply polling and statistics on both sides
//!
//! Usage: cargo run --features demo --bin demo [udp|tcp]
//! Log level: RUST_LOG=debug cargo run --features demo --bin demo

use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::time::{sleep, Instant};
use tracing_subscriber::EnvFilter;

use modbus_ip::{
    MasterConfig, MasterTransport, ModbusMaster, ModbusPdu, ModbusResult, ModbusSlave,
    PduHandler, ReplyDisposition, ServerConfig, SlaveTransport,
};

const REGISTER_COUNT: usize = 32;

/// Register and coil storage answering FC03, FC05 and FC06
struct DemoCore {
    holding: [u16; REGISTER_COUNT],
    coils: [bool; REGISTER_COUNT],
}

impl DemoCore {
    fn new() -> Self {
        Self {
            holding: [0; REGISTER_COUNT],
            coils: [false; REGISTER_COUNT],
        }
    }

    fn exception(pdu: &mut ModbusPdu, code: u8) -> ReplyDisposition {
        let fc = pdu.function_code().unwrap_or(0) | 0x80;
        let _ = pdu.replace(&[fc, code]);
        ReplyDisposition::Normal
    }
}

impl PduHandler for DemoCore {
    fn process_pdu(&mut self, pdu: &mut ModbusPdu) -> ReplyDisposition {
        let data = pdu.as_slice();
        if data.len() != 5 {
            return Self::exception(pdu, 0x03);
        }
        let address = u16::from_be_bytes([data[1], data[2]]) as usize;
        let word = u16::from_be_bytes([data[3], data[4]]);

        match data[0] {
            0x03 => {
                let count = word as usize;
                if count == 0 || address + count > REGISTER_COUNT {
                    return Self::exception(pdu, 0x02);
                }
                let mut reply = vec![0x03, (count * 2) as u8];
                for value in &self.holding[address..address + count] {
                    reply.extend_from_slice(&value.to_be_bytes());
                }
                let _ = pdu.replace(&reply);
                ReplyDisposition::Normal
            }
            0x05 if address < REGISTER_COUNT => {
                self.coils[address] = word == 0xFF00;
                ReplyDisposition::Echo
            }
            0x06 if address < REGISTER_COUNT => {
                self.holding[address] = word;
                ReplyDisposition::Echo
            }
            0x05 | 0x06 => Self::exception(pdu, 0x02),
            _ => Self::exception(pdu, 0x01),
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let filter = EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new("info"))?;
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();

    println!("{}", modbus_ip::info());
    println!("=============================");

    let mode = std::env::args().nth(1).unwrap_or_else(|| "udp".to_string());
    let loopback = IpAddr::V4(Ipv4Addr::LOCALHOST);
    let server_config = ServerConfig::new()
        .with_bind_address((loopback, 0).into())
        .with_packet_logging(true);
    let master_config = MasterConfig::new().with_local_address((loopback, 0).into());

    match mode.as_str() {
        "tcp" => {
            let slave = ModbusSlave::tcp(server_config, DemoCore::new()).await?;
            let port = slave.transport().local_addr()?.port();
            let master = ModbusMaster::tcp(master_config.with_remote_port(port))?;
            run_exchange(slave, master).await?;
        }
        "udp" => {
            let slave = ModbusSlave::udp(server_config, DemoCore::new()).await?;
            let port = slave.transport().local_addr()?.port();
            let master = ModbusMaster::udp(master_config.with_remote_port(port)).await?;
            run_exchange(slave, master).await?;
        }
        other => {
            eprintln!("Unknown mode '{}', expected 'udp' or 'tcp'", other);
            std::process::exit(2);
        }
    }

    println!("\nDemo completed!");
    Ok(())
}

async fn run_exchange<T, M>(
    mut slave: ModbusSlave<T, DemoCore>,
    mut master: ModbusMaster<M>,
) -> ModbusResult<()>
where
    T: SlaveTransport + 'static,
    M: MasterTransport,
{
    let (stop_tx, stop_rx) = oneshot::channel::<()>();
    let slave_task = tokio::spawn(async move {
        let result = slave
            .run_until(Duration::from_millis(2), async {
                let _ = stop_rx.await;
            })
            .await;
        (slave, result)
    });

    let target = IpAddr::V4(Ipv4Addr::LOCALHOST);

    println!("\nWrite Operations:");
    let tid = master.send_holding_register(target, 10, 42).await?;
    println!("  FC06 register 10 = 42 (tid {})", tid);
    wait_reply(&mut master).await?;

    let tid = master.send_coil(target, 3, true).await?;
    println!("  FC05 coil 3 = ON (tid {})", tid);
    wait_reply(&mut master).await?;

    let _ = stop_tx.send(());
    let (slave, result) = slave_task
        .await
        .map_err(|e| modbus_ip::ModbusError::protocol(format!("Slave task failed: {}", e)))?;
    result?;

    println!("\nSlave State:");
    println!("  Register 10: {}", slave.handler().holding[10]);
    println!("  Coil 3: {}", if slave.handler().coils[3] { "ON" } else { "OFF" });

    let stats = slave.get_stats();
    println!("\nStatistics:");
    println!(
        "  Slave: requests {}, replies {}, dropped {}",
        stats.requests,
        stats.replies,
        stats.dropped()
    );
    let master_stats = master.get_stats();
    println!(
        "  Master: frames sent {}, bytes sent {}, bytes received {}",
        master_stats.frames_sent, master_stats.bytes_sent, master_stats.bytes_received
    );

    master.close().await
}

async fn wait_reply<M: MasterTransport>(master: &mut ModbusMaster<M>) -> ModbusResult<()> {
    let deadline = Instant::now() + Duration::from_secs(2);
    while Instant::now() < deadline {
        if let Some(reply) = master.poll_reply()? {
            println!(
                "  <- reply tid {} from {}: {:02X?}",
                reply.transaction_id,
                reply.peer,
                reply.pdu.as_slice()
            );
            return Ok(());
        }
        sleep(Duration::from_millis(5)).await;
    }
    println!("  <- no reply within 2s");
    Ok(())
}
