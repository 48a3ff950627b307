mod backends;

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use backends::{OrtEmbedder, WhisperAsr, WhisperOpts};
use clap::Parser;
use futures_util::{SinkExt, StreamExt};
use meeting_core::speaker::SpeakerStorage;
use meeting_core::{AudioProcessor, Config};
use ort::session::{builder::GraphOptimizationLevel, Session};
use shared_protocol::{AUDIO_FRAME_HEADER_LEN, ClientMessage, ErrorEvent, ServerMessage, SystemComponents};
use shared_vad::EarshotVad;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::Message;
use tracing::{error, info, warn};
use whisper_rs::{SamplingStrategy, WhisperContext, WhisperContextParameters};

#[derive(Parser, Debug)]
#[command(name = "meeting-server")]
struct Args {
    #[arg(short, long, default_value = "[::]", help = "address to listen on")]
    address: String,

    #[arg(short, long, default_value = "8001", help = "port to listen on")]
    port: u16,

    #[arg(long, help = "path to whisper model file")]
    whisper_model: String,

    #[arg(long, help = "path to the speaker-embedding ONNX model")]
    embedding_model: String,

    #[arg(long, default_value = "input", help = "embedding model input tensor name")]
    embedding_input: String,

    #[arg(long, default_value = "output", help = "embedding model output tensor name")]
    embedding_output: String,

    #[arg(long, help = "path to an optional TOML config file")]
    config: Option<String>,

    #[arg(long, default_value = "./data", help = "directory for persisted speaker profiles")]
    data_dir: String,

    #[arg(long, help = "path to optional API token")]
    token_file: Option<String>,

    #[arg(
        long,
        help = "Best-of (default: 1, mutually exclusive with --beam-size)",
        conflicts_with = "beam_size"
    )]
    best_of: Option<i32>,
    #[arg(
        long,
        help = "Beam search size (mutually exclusive with --best-of)",
        conflicts_with = "best_of"
    )]
    beam_size: Option<i32>,

    #[arg(long, help = "Scale audio_ctx to buffer length (faster for short chunks)")]
    dynamic_audio_ctx: bool,

    #[arg(long, help = "Temp increment on decode retry (0 = no retry, default: 0.2)")]
    temperature_inc: Option<f32>,

    #[arg(long, help = "Entropy threshold for decode retry (default: 2.4)")]
    entropy_thold: Option<f32>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let args = Args::parse();
    let addr: SocketAddr = format!("{}:{}", args.address, args.port).parse()?;

    let cfg = match &args.config {
        Some(path) => {
            let raw = std::fs::read_to_string(path)
                .with_context(|| format!("failed to read config file {path}"))?;
            Config::from_toml_str(&raw)?
        }
        None => Config::default(),
    };

    info!("Loading whisper model: {}", args.whisper_model);
    let whisper_ctx = {
        let mut params = WhisperContextParameters::default();
        params.flash_attn(true);
        #[cfg(not(feature = "vulkan"))]
        info!("Running on CPU");
        #[cfg(feature = "vulkan")]
        {
            info!("Running with GPU acceleration (Vulkan)");
            params.use_gpu(true);
        }
        WhisperContext::new_with_params(&args.whisper_model, params)
            .context("failed to load whisper model")?
    };

    let sampling_strategy = match (args.beam_size, args.best_of) {
        (Some(beam_size), None) => {
            info!("Using beam search with beam_size={}", beam_size);
            SamplingStrategy::BeamSearch { beam_size, patience: -1.0 }
        }
        (None, Some(best_of)) => {
            info!("Using greedy search with best_of={}", best_of);
            SamplingStrategy::Greedy { best_of }
        }
        (None, None) => {
            info!("Using greedy search with best_of=1 (default)");
            SamplingStrategy::Greedy { best_of: 1 }
        }
        (Some(_), Some(_)) => unreachable!("beam_size and best_of are mutually exclusive"),
    };

    let whisper_opts = WhisperOpts {
        dynamic_audio_ctx: args.dynamic_audio_ctx,
        temperature_inc: args.temperature_inc,
        entropy_thold: args.entropy_thold,
    };
    let asr: Arc<dyn meeting_core::Asr> =
        Arc::new(WhisperAsr::new(whisper_ctx, sampling_strategy, whisper_opts)?);

    info!("Loading embedding model: {}", args.embedding_model);
    let embedding_session = Session::builder()?
        .with_optimization_level(GraphOptimizationLevel::Level3)?
        .commit_from_file(&args.embedding_model)
        .with_context(|| format!("failed to load embedding model {}", args.embedding_model))?;
    let embedder: Arc<dyn meeting_core::Embedder> =
        Arc::new(OrtEmbedder::new(embedding_session, args.embedding_input, args.embedding_output));

    let vad_model: Arc<dyn shared_vad::VadModel> = Arc::new(EarshotVad::new());

    let expected_token = match &args.token_file {
        Some(path) => {
            info!("API token authentication enabled");
            let token = std::fs::read_to_string(path)
                .with_context(|| format!("failed to read token file {path}"))?;
            Some(token.trim().to_string())
        }
        None => None,
    };

    info!("Listening on {}", addr);
    let listener = TcpListener::bind(addr).await?;
    while let Ok((stream, peer_addr)) = listener.accept().await {
        info!("Connection from {}", peer_addr);
        let cfg = cfg.clone();
        let asr = asr.clone();
        let embedder = embedder.clone();
        let vad_model = vad_model.clone();
        let expected_token = expected_token.clone();
        let data_dir = args.data_dir.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_connection(stream, cfg, vad_model, asr, embedder, expected_token, data_dir).await {
                error!("Connection error: {}", e);
            }
        });
    }
    Ok(())
}

macro_rules! bail {
    ($ws_sender:expr, $($arg:tt)*) => {{
        let msg = format!($($arg)*);
        let m = ServerMessage::Error(ErrorEvent { code: 400, message: msg.clone(), context: None });
        if let Ok(json) = serde_json::to_string(&m) {
            let _ = $ws_sender.send(Message::Text(json)).await;
        }
        let _ = $ws_sender.send(Message::Close(None)).await;
        return Err(anyhow::anyhow!(msg));
    }};
}

async fn handle_connection(
    stream: TcpStream,
    cfg: Config,
    vad_model: Arc<dyn shared_vad::VadModel>,
    asr: Arc<dyn meeting_core::Asr>,
    embedder: Arc<dyn meeting_core::Embedder>,
    expected_token: Option<String>,
    data_dir: String,
) -> Result<()> {
    let ws_stream = tokio_tungstenite::accept_async(stream).await?;
    let (mut ws_sender, mut ws_receiver) = ws_stream.split();

    let (token, language, meeting_id) = match ws_receiver.next().await {
        Some(Ok(Message::Text(text))) => match serde_json::from_str::<ClientMessage>(&text) {
            Ok(ClientMessage::Configure { token, language, meeting_id }) => (token, language, meeting_id),
            Ok(_) => bail!(ws_sender, "first message must be Configure"),
            Err(e) => bail!(ws_sender, "failed to parse Configure: {}", e),
        },
        Some(Ok(_)) => bail!(ws_sender, "must send Configure first"),
        Some(Err(e)) => bail!(ws_sender, "pre-configure error: {}", e),
        None => bail!(ws_sender, "connection closed before Configure"),
    };

    if let Some(ref expected) = expected_token {
        match token {
            Some(ref t) if t == expected => (),
            Some(_) => bail!(ws_sender, "wrong API token"),
            None => bail!(ws_sender, "missing API token"),
        }
    }

    let meeting_id = meeting_id.unwrap_or(0);
    info!("Configured: language={:?}, meeting_id={}", language, meeting_id);

    let storage = SpeakerStorage::new(data_dir);
    let (events_tx, mut events_rx) = meeting_core::events::channel(cfg.events.channel_capacity);
    let processor = match AudioProcessor::new(cfg.clone(), vad_model, asr, embedder, events_tx, storage, meeting_id) {
        Ok(p) => Arc::new(p),
        Err(e) => bail!(ws_sender, "failed to start processor: {}", e),
    };
    if let Some(lang) = language {
        processor.set_language(lang).await;
    }

    let ready = ServerMessage::SystemStatus {
        status: "ready".to_string(),
        components: SystemComponents { audio: true, llm: true, rag: false },
    };
    ws_sender.send(Message::Text(serde_json::to_string(&ready)?)).await?;

    let sample_rate = cfg.audio.sample_rate as f64;
    let cleanup_interval = std::time::Duration::from_secs_f64(cfg.vad_manager.cleanup_interval_secs.max(1.0));
    let mut cleanup_tick = tokio::time::interval(cleanup_interval);
    cleanup_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cleanup_tick.tick() => {
                processor.run_periodic_cleanup().await;
            }
            event = events_rx.recv() => {
                match event {
                    Some(msg) => {
                        let json = serde_json::to_string(&msg)?;
                        ws_sender.send(Message::Text(json)).await?;
                    }
                    None => break,
                }
            }
            frame = ws_receiver.next() => {
                match frame {
                    Some(Ok(Message::Binary(data))) => {
                        if data.len() < AUDIO_FRAME_HEADER_LEN {
                            bail!(ws_sender, "audio frame shorter than the {}-byte header", AUDIO_FRAME_HEADER_LEN);
                        }
                        let end = f64::from_le_bytes(data[..AUDIO_FRAME_HEADER_LEN].try_into().unwrap());
                        let samples: Vec<i16> = data[AUDIO_FRAME_HEADER_LEN..]
                            .chunks_exact(2)
                            .map(|b| i16::from_le_bytes([b[0], b[1]]))
                            .collect();
                        let start = end - samples.len() as f64 / sample_rate;
                        if let Err(e) = processor.process_audio(samples, start, end).await {
                            warn!("process_audio error: {}", e);
                            let err = ServerMessage::Error(ErrorEvent { code: 422, message: e.to_string(), context: None });
                            ws_sender.send(Message::Text(serde_json::to_string(&err)?)).await?;
                        }
                    }
                    Some(Ok(Message::Text(text))) => {
                        match serde_json::from_str::<ClientMessage>(&text) {
                            Ok(ClientMessage::Configure { .. }) => bail!(ws_sender, "Configure sent after session started"),
                            Ok(ClientMessage::SwitchMeeting { meeting_id }) => {
                                if let Err(e) = processor.switch_meeting(meeting_id).await {
                                    bail!(ws_sender, "switch_meeting failed: {}", e);
                                }
                            }
                            Ok(ClientMessage::AudioStreamStop) => {
                                if let Err(e) = processor.force_process_pending().await {
                                    bail!(ws_sender, "failed to flush pending segment: {}", e);
                                }
                            }
                            Err(e) => bail!(ws_sender, "cannot parse message: {}", e),
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        ws_sender.send(Message::Pong(data)).await?;
                    }
                    Some(Ok(Message::Pong(_) | Message::Frame(_))) => {}
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(e)) => bail!(ws_sender, "websocket error: {}", e),
                }
            }
        }
    }

    let _ = ws_sender.send(Message::Close(None)).await;
    info!("Session ended");
    Ok(())
}
