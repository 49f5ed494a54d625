mod common;

use std::{
    io::{Read, Write},
    net::TcpListener,
    process::Command,
};

use anyhow::Result;

use seplos_mqtt::protocol::frame::{Frame, FRAME_END};

fn binary() -> Command {
    let mut command = Command::new(env!("CARGO_BIN_EXE_seplos_mqtt"));
    for var in ["MQTT_HOST", "SERIAL_INTERFACE", "NUMBER_OF_PACKS", "LOGGING_LEVEL"] {
        command.env_remove(var);
    }
    command
}

/// Serve every request on one connection the way a single pack would.
fn spawn_pack_bridge(listener: TcpListener) -> std::thread::JoinHandle<usize> {
    std::thread::spawn(move || {
        let Ok((mut stream, _)) = listener.accept() else {
            return 0;
        };
        let mut answered = 0;
        let mut request = Vec::new();
        let mut byte = [0u8; 1];
        while let Ok(1) = stream.read(&mut byte) {
            request.push(byte[0]);
            if byte[0] != FRAME_END {
                continue;
            }
            if let Ok(frame) = Frame::decode(&request) {
                let reply = common::response(frame.address, frame.command);
                if stream.write_all(&reply).is_err() {
                    break;
                }
                answered += 1;
            }
            request.clear();
        }
        answered
    })
}

#[test]
fn test_help_lists_bus_and_broker_options() -> Result<()> {
    let output = binary().arg("--help").output()?;
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("Usage: seplos_mqtt"));
    for option in ["--serial-interface", "--number-of-packs", "--mqtt-host", "--output"] {
        assert!(stdout.contains(option), "missing {option}");
    }
    Ok(())
}

#[test]
fn test_missing_sink_fails_startup() -> Result<()> {
    let output = binary()
        .args(["--serial-interface", "tcp://127.0.0.1:1", "--cycles", "1"])
        .output()?;
    assert!(!output.status.success());
    Ok(())
}

#[test]
fn test_single_cycle_over_tcp_bridge() -> Result<()> {
    let listener = TcpListener::bind("127.0.0.1:0")?;
    let port = listener.local_addr()?.port();
    let bridge = spawn_pack_bridge(listener);

    let output = binary()
        .args([
            "--serial-interface",
            &format!("tcp://127.0.0.1:{port}"),
            "--output",
            "stdout",
            "--cycles",
            "1",
            "--settle-delay-ms",
            "0",
        ])
        .output()?;
    assert!(
        output.status.success(),
        "stderr: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    assert_eq!(bridge.join().unwrap(), 2);

    let stdout = String::from_utf8(output.stdout)?;
    let lines: Vec<&str> = stdout.lines().collect();
    assert_eq!(lines.len(), 1);
    let line: serde_json::Value = serde_json::from_str(lines[0])?;
    assert_eq!(line["pack"], 0);
    assert_eq!(line["data"]["telemetry"]["dis_charge_current"], -12.5);
    assert_eq!(line["data"]["telemetry"]["voltage_cell_16"], 3.3);
    assert_eq!(line["data"]["telesignalization"]["system_status"], "standby");
    Ok(())
}
