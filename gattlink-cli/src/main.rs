use anyhow::{Context, Result, bail};
use bytes::Bytes;
use clap::{Args, Parser, Subcommand};
use clap_verbosity_flag::{InfoLevel, Verbosity};
use gattlink_lib::cipher::{AesCipher, CipherConfig, CipherMode, Key, ModeParams};
use gattlink_lib::cmac::aes_cmac;
use gattlink_lib::codec::{bytes_to_hex, bytes_to_text, hex_to_bytes, text_to_bytes};
use gattlink_lib::config::LinkConfig;
use gattlink_lib::constants::MAX_NOTIFICATION_CHUNK;
use gattlink_lib::correlator::ResponseFilter;
use gattlink_lib::device::GattDevice;
use gattlink_lib::framing::{FrameReassembler, FramingPolicy};
use gattlink_lib::gatt::{WELL_KNOWN_SERVICES, battery_level_endpoint, device_information, device_information_endpoint};
use gattlink_lib::simulated::SimTransport;
use gattlink_lib::transport::{ConnectOptions, Endpoint};
use std::fs::File;
use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use tracing::{debug, error, info};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// AES modes, CMAC and BLE message reassembly for GATT peripherals.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Link configuration file (JSON). Defaults apply to missing fields.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,
    /// Optional path to a file to write logs to, in addition to the console.
    #[arg(short, long, global = true)]
    log_file: Option<PathBuf>,
    #[command(flatten)]
    verbose: Verbosity<InfoLevel>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Encrypt text or hex input and print the ciphertext as hex
    Encrypt {
        #[command(flatten)]
        cipher: CipherArgs,
        #[command(flatten)]
        input: InputArgs,
    },
    /// Decrypt hex input and print the plaintext
    Decrypt {
        #[command(flatten)]
        cipher: CipherArgs,
        /// Ciphertext as hex
        #[arg(long = "hex")]
        ciphertext: String,
    },
    /// Compute the AES-CMAC tag of the input
    Cmac {
        /// 16-byte key as hex
        #[arg(short, long)]
        key: String,
        #[command(flatten)]
        input: InputArgs,
    },
    /// Feed hex notification chunks through a reassembler and print each message
    Reassemble {
        /// Start marker byte as hex (defaults to the configured policy)
        #[arg(long)]
        start: Option<String>,
        /// Stop marker byte as hex (defaults to the configured policy)
        #[arg(long)]
        stop: Option<String>,
        /// Raw chunks, in arrival order
        #[arg(required = true)]
        chunks: Vec<String>,
    },
    /// Run a request/response exchange against a simulated peripheral
    Demo {
        /// Encrypt the simulated response under this key and decrypt it on receipt
        #[arg(short, long)]
        key: Option<String>,
    },
}

#[derive(Args, Debug)]
struct CipherArgs {
    /// 16-byte key as hex
    #[arg(short, long)]
    key: String,
    /// 16-byte initial vector as hex (all zero when omitted)
    #[arg(long)]
    iv: Option<String>,
    /// CBC, CTR, CFB, OFB or ECB
    #[arg(short, long, default_value_t = CipherMode::Cbc)]
    mode: CipherMode,
    /// Starting counter, required for CTR
    #[arg(long)]
    counter: Option<u64>,
    /// Segment size in bytes, required for CFB
    #[arg(long)]
    segment_size: Option<usize>,
}

impl CipherArgs {
    fn cipher(&self) -> Result<AesCipher> {
        let key = hex_to_bytes(&self.key).context("Invalid key")?;
        let iv = self.iv.as_deref().map(hex_to_bytes).transpose().context("Invalid IV")?;
        let params = ModeParams {
            counter: self.counter,
            segment_size: self.segment_size,
        };
        let config = CipherConfig::from_slices(&key, iv.as_deref())?.with_mode(self.mode, params);
        let mut cipher = AesCipher::new();
        cipher.configure(config)?;
        Ok(cipher)
    }
}

#[derive(Args, Debug)]
#[group(required = true, multiple = false)]
struct InputArgs {
    /// UTF-8 input
    #[arg(long)]
    text: Option<String>,
    /// Hex input
    #[arg(long = "hex")]
    hex_input: Option<String>,
}

impl InputArgs {
    fn bytes(&self) -> Result<Vec<u8>> {
        match (&self.text, &self.hex_input) {
            (Some(text), _) => Ok(text_to_bytes(text)),
            (None, Some(hex)) => Ok(hex_to_bytes(hex).context("Invalid hex input")?),
            (None, None) => bail!("either --text or --hex is required"),
        }
    }
}

/// Console logs on stderr so stdout stays clean for results. With
/// `--log-file`, an uncoloured copy goes to that file as well.
fn init_logging(cli: &Cli) -> Result<Option<WorkerGuard>> {
    // -v and -vv raise the default level; RUST_LOG overrides it
    let filter = EnvFilter::builder()
        .with_default_directive(cli.verbose.tracing_level_filter().into())
        .from_env_lossy();

    let log_file = cli
        .log_file
        .as_deref()
        .map(|path| File::create(path).with_context(|| format!("Cannot create log file {}", path.display())))
        .transpose()?;
    let (file_writer, guard) = match log_file {
        Some(file) => {
            let (writer, guard) = tracing_appender::non_blocking(file);
            (Some(writer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).with_target(false).without_time())
        .with(file_writer.map(|writer| fmt::layer().with_writer(writer).with_ansi(false)))
        .init();

    if let Some(path) = &cli.log_file {
        debug!(path = %path.display(), "Writing logs to file");
    }
    Ok(guard)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let _guard = init_logging(&cli)?;

    if let Err(e) = run(cli).await {
        error!("{:?}", e);
        process::exit(1);
    }

    Ok(())
}

async fn run(cli: Cli) -> Result<()> {
    let config = match &cli.config {
        Some(path) => {
            LinkConfig::from_file(path).with_context(|| format!("Failed to load config from {:?}", path))?
        }
        None => LinkConfig::default(),
    };
    debug!(?config, "Link configuration");

    match cli.command {
        Command::Encrypt { cipher, input } => {
            let ciphertext = cipher.cipher()?.encrypt(&input.bytes()?)?;
            println!("{}", bytes_to_hex(&ciphertext));
        }
        Command::Decrypt { cipher, ciphertext } => {
            let ciphertext = hex_to_bytes(&ciphertext).context("Invalid ciphertext")?;
            let plaintext = cipher.cipher()?.decrypt(&ciphertext)?;
            println!("{}", bytes_to_hex(&plaintext));
            if let Ok(text) = bytes_to_text(&plaintext) {
                println!("{}", text.trim_end_matches('\0'));
            }
        }
        Command::Cmac { key, input } => {
            let key = parse_key(&key)?;
            println!("{}", bytes_to_hex(&aes_cmac(&key, &input.bytes()?)));
        }
        Command::Reassemble { start, stop, chunks } => {
            let mut policy = config.framing.clone();
            if let Some(start) = start {
                policy.start_marker = parse_byte(&start)?;
            }
            if let Some(stop) = stop {
                policy.stop_marker = parse_byte(&stop)?;
            }
            reassemble(policy, &chunks)?;
        }
        Command::Demo { key } => {
            let key = key.as_deref().map(parse_key).transpose()?;
            demo(config, key).await?;
        }
    }
    Ok(())
}

fn parse_key(text: &str) -> Result<Key> {
    let bytes = hex_to_bytes(text).context("Invalid key")?;
    let len = bytes.len();
    bytes
        .try_into()
        .map_err(|_| anyhow::anyhow!("key must be 16 bytes, got {len}"))
}

fn parse_byte(text: &str) -> Result<u8> {
    match hex_to_bytes(text)?.as_slice() {
        [byte] => Ok(*byte),
        other => bail!("expected one byte, got {}", other.len()),
    }
}

fn reassemble(policy: FramingPolicy, chunks: &[String]) -> Result<()> {
    let mut reassembler = FrameReassembler::new(policy)?;
    let mut emitted = 0;
    for chunk in chunks {
        let chunk = hex_to_bytes(chunk).with_context(|| format!("Invalid chunk {chunk:?}"))?;
        if let Some(message) = reassembler.push(&chunk) {
            println!("{}", bytes_to_hex(&message));
            emitted += 1;
        }
    }
    let leftover = reassembler.state().buffer.len();
    if leftover > 0 && !reassembler.state().length_matches {
        info!(bytes = leftover, "Incomplete message left in the buffer");
    }
    info!(messages = emitted, "Reassembly finished");
    Ok(())
}

/// `[0x02][len:2][data][xor checksum][0x03]`
fn frame(data: &[u8]) -> Vec<u8> {
    let mut message = vec![0x02];
    message.extend_from_slice(&(data.len() as u16).to_be_bytes());
    message.extend_from_slice(data);
    message.push(data.iter().fold(0u8, |acc, b| acc ^ b));
    message.push(0x03);
    message
}

async fn demo(config: LinkConfig, key: Option<Key>) -> Result<()> {
    let sim = SimTransport::with_device("GATT-DEMO").await;
    sim.set_value(&battery_level_endpoint(), vec![87u8]).await;
    sim.set_value(&device_information_endpoint(device_information::MANUFACTURER_NAME), "gattlink")
        .await;

    let options = ConnectOptions {
        name_prefix: Some("GATT".to_string()),
        optional_services: WELL_KNOWN_SERVICES.iter().map(|s| s.to_string()).collect(),
        ..ConnectOptions::default()
    };
    let device = GattDevice::connect(Arc::new(sim.clone()), &options, config).await?;
    let request_endpoint = Endpoint::new("demo_service", "request");
    let response_endpoint = Endpoint::new("demo_service", "response");
    let status = device.start_notifier(response_endpoint.clone()).await?;
    info!(%status, "Response notifier");

    // The peripheral answers the first write with a framed status block
    let mut payload = *b"\x83status: ready!!";
    if let Some(key) = &key {
        let mut cipher = AesCipher::new();
        cipher.configure(CipherConfig::new(*key))?;
        let encrypted = cipher.encrypt(&payload)?;
        payload.copy_from_slice(&encrypted);
    }
    let response = frame(&payload);
    let mut writes = sim.writes();
    let peripheral = sim.clone();
    let notify_endpoint = response_endpoint.clone();
    tokio::spawn(async move {
        if let Ok((endpoint, chunk)) = writes.recv().await {
            debug!(%endpoint, bytes = bytes_to_hex(&chunk), "Peripheral received request");
            peripheral
                .notify_chunked(&notify_endpoint, &response, MAX_NOTIFICATION_CHUNK)
                .await;
        }
    });

    let request = frame(&[0x6B, 0x01]);
    let filter = ResponseFilter::from([(3, 0x83)]);
    let answer: Bytes = device
        .send_and_wait(&request, &request_endpoint, &filter, key.as_ref())
        .await?;
    println!("response: {}", bytes_to_hex(&answer));

    println!("battery level: {}%", device.battery_level().await?);
    let info = device.device_information().await?;
    println!("manufacturer: {}", info.manufacturer_name.as_deref().unwrap_or("-"));

    device.disconnect().await?;
    Ok(())
}
