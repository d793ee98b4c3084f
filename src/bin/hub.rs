use arod_instbox::devices::{ServoState, SourceState};
use arod_instbox::protocol::{ControlMessage, MotorCommand, TelemetryFrame, FRAME_SIZE};
use clap::{App, Arg};
use colored::*;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const DEFAULT_BIND: &str = "0.0.0.0";
const DEFAULT_CTRL_PORT: &str = "65433";
const DEFAULT_STREAM_PORT: &str = "65432";

struct HubState {
    settings: Mutex<ControlMessage>,
    ctrl_writer: Mutex<Option<OwnedWriteHalf>>,
    print_every: u64,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let matches = App::new("arod-hub")
        .version("0.1.0")
        .author("ATHENA Rods Team")
        .about("⚛️  Bench hub for the instrument box: shows telemetry, sends settings")
        .arg(
            Arg::with_name("bind")
                .short("b")
                .long("bind")
                .value_name("ADDR")
                .help("Address to listen on")
                .takes_value(true)
                .default_value(DEFAULT_BIND),
        )
        .arg(
            Arg::with_name("ctrl-port")
                .long("ctrl-port")
                .value_name("PORT")
                .takes_value(true)
                .default_value(DEFAULT_CTRL_PORT),
        )
        .arg(
            Arg::with_name("stream-port")
                .long("stream-port")
                .value_name("PORT")
                .takes_value(true)
                .default_value(DEFAULT_STREAM_PORT),
        )
        .arg(
            Arg::with_name("every")
                .short("e")
                .long("every")
                .value_name("N")
                .help("Print every Nth telemetry frame")
                .takes_value(true)
                .default_value("10"),
        )
        .get_matches();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let bind = matches.value_of("bind").unwrap_or(DEFAULT_BIND);
    let ctrl_port: u16 = matches.value_of("ctrl-port").unwrap_or(DEFAULT_CTRL_PORT).parse()?;
    let stream_port: u16 = matches.value_of("stream-port").unwrap_or(DEFAULT_STREAM_PORT).parse()?;
    let print_every: u64 = matches.value_of("every").unwrap_or("10").parse::<u64>()?.max(1);

    let ctrl_listener = TcpListener::bind((bind, ctrl_port)).await?;
    let stream_listener = TcpListener::bind((bind, stream_port)).await?;

    println!("{}", "⚛️  ATHENA rods bench hub".bright_blue().bold());
    println!(
        "   control on {}:{}, telemetry on {}:{}",
        bind, ctrl_port, bind, stream_port
    );
    println!(
        "   commands: {}",
        "up | down | stop | scram | engage | source on | source off | quit".bright_white()
    );

    let state = Arc::new(HubState {
        settings: Mutex::new(ControlMessage {
            motor: MotorCommand::Stop,
            servo: ServoState::Scram,
            source: SourceState::Off,
        }),
        ctrl_writer: Mutex::new(None),
        print_every,
    });

    tokio::spawn(accept_control(ctrl_listener, state.clone()));
    tokio::spawn(accept_stream(stream_listener, state.clone()));

    let mut stdin = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = stdin.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if line == "quit" || line == "exit" {
            break;
        }

        let msg = {
            let mut settings = state.settings.lock().await;
            if let Err(e) = apply_operator_command(&mut settings, line) {
                println!("{} {}", "❌".red(), e.bright_red());
                continue;
            }
            *settings
        };
        send_settings(&state, &msg).await;
    }

    println!("{}", "Hub stopped".bright_blue());
    Ok(())
}

fn apply_operator_command(settings: &mut ControlMessage, line: &str) -> Result<(), String> {
    let words: Vec<&str> = line.split_whitespace().collect();
    match words.as_slice() {
        ["up"] => settings.motor = MotorCommand::Up,
        ["down"] => settings.motor = MotorCommand::Down,
        ["stop"] => settings.motor = MotorCommand::Stop,
        ["scram"] => {
            settings.servo = ServoState::Scram;
            settings.motor = MotorCommand::Stop;
        }
        ["engage"] => settings.servo = ServoState::Engaged,
        ["source", "on"] => settings.source = SourceState::On,
        ["source", "off"] => settings.source = SourceState::Off,
        _ => return Err(format!("Unknown command: {}", line)),
    }
    Ok(())
}

/// A redialling box starts with its motor held stopped. Only servo and
/// source survive a reconnect; motion needs a fresh operator command.
fn settings_for_reconnect(settings: &mut ControlMessage) -> ControlMessage {
    settings.motor = MotorCommand::Stop;
    *settings
}

async fn send_settings(state: &HubState, msg: &ControlMessage) {
    let mut writer = state.ctrl_writer.lock().await;
    let Some(stream) = writer.as_mut() else {
        println!("{} {}", "⚠️".yellow(), "No instrument box on the control port".yellow());
        return;
    };

    let mut line = msg.to_json();
    line.push('\n');
    match stream.write_all(line.as_bytes()).await {
        Ok(()) => println!(
            "{} motor {} servo {} source {}",
            "📤".green(),
            format!("{:?}", msg.motor).bright_cyan(),
            format!("{:?}", msg.servo).bright_cyan(),
            format!("{:?}", msg.source).bright_cyan()
        ),
        Err(e) => {
            println!("{} Send failed: {}", "❌".red(), e.to_string().bright_red());
            *writer = None;
        }
    }
}

async fn accept_control(listener: TcpListener, state: Arc<HubState>) {
    loop {
        match listener.accept().await {
            Ok((stream, addr)) => {
                info!("Control connection from {}", addr);
                if let Err(e) = stream.set_nodelay(true) {
                    warn!("set_nodelay failed: {}", e);
                }
                let (reader, writer) = stream.into_split();
                *state.ctrl_writer.lock().await = Some(writer);

                let msg = {
                    let mut settings = state.settings.lock().await;
                    settings_for_reconnect(&mut settings)
                };
                send_settings(&state, &msg).await;

                tokio::spawn(async move {
                    let mut lines = BufReader::new(reader).lines();
                    while let Ok(Some(line)) = lines.next_line().await {
                        println!("{} {}", "🔔".yellow(), line.bright_yellow());
                    }
                    info!("Control connection from {} closed", addr);
                });
            }
            Err(e) => warn!("Control accept failed: {}", e),
        }
    }
}

async fn accept_stream(listener: TcpListener, state: Arc<HubState>) {
    loop {
        match listener.accept().await {
            Ok((stream, addr)) => {
                info!("Telemetry connection from {}", addr);
                let state = state.clone();
                tokio::spawn(async move {
                    let frames = print_frames(stream, state.print_every).await;
                    info!("Telemetry connection from {} closed after {} frames", addr, frames);
                });
            }
            Err(e) => warn!("Telemetry accept failed: {}", e),
        }
    }
}

async fn print_frames(mut stream: TcpStream, print_every: u64) -> u64 {
    let mut buf = [0u8; FRAME_SIZE];
    let mut count: u64 = 0;
    while stream.read_exact(&mut buf).await.is_ok() {
        count += 1;
        if count % print_every != 0 {
            continue;
        }
        let Ok(frame) = TelemetryFrame::decode(&buf) else {
            continue;
        };
        println!("{}", format_frame(&frame));
    }
    count
}

fn format_frame(frame: &TelemetryFrame) -> String {
    let rho_pcm = frame.reactivity * 1e5;
    let rho = if rho_pcm > 0.0 {
        format!("{:>+8.1} pcm", rho_pcm).red()
    } else {
        format!("{:>+8.1} pcm", rho_pcm).green()
    };
    let distance = if frame.distance < 0.0 {
        "     n/a".bright_red()
    } else {
        format!("{:>5.2} cm", frame.distance).white()
    };
    format!(
        "{} N {:>10.3e}  rho {}  rod {}",
        "📡".bright_blue(),
        frame.neutron_density,
        rho,
        distance
    )
}
