use clap::Parser;
use metrics_exporter_prometheus::PrometheusBuilder;
use roomload::config::{
    ConnectionConfig, DEFAULT_DATA_BITRATE_KBPS, DEFAULT_DATA_PACKET_BYTES, DEFAULT_NUM_PER_SECOND, DEFAULT_ROOM,
    LoadTestParams, parse_duration,
};
use roomload::{LoadTest, LoadTestError, LoopbackOptions, Report, transport_for_url};
use std::net::SocketAddr;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Load tester for real-time media rooms
#[derive(Debug, Parser)]
#[command(name = "roomload", version, about)]
struct Args {
    /// Room service URL (defaults to ROOMLOAD_URL, then loopback://local)
    #[arg(long)]
    url: Option<String>,
    #[arg(long)]
    api_key: Option<String>,
    #[arg(long)]
    api_secret: Option<String>,

    /// Room name; per-publisher rooms get a `_<id>` suffix
    #[arg(long, default_value = DEFAULT_ROOM)]
    room: String,
    /// Identity prefix; random when unset
    #[arg(long)]
    id_prefix: Option<String>,
    /// How long to run, e.g. 30s, 2m, 1h. Zero runs until interrupted.
    #[arg(long, value_parser = parse_duration, default_value = "0")]
    duration: Duration,

    #[arg(long, default_value_t = 0)]
    video_publishers: usize,
    #[arg(long, default_value_t = 0)]
    audio_publishers: usize,
    #[arg(long, default_value_t = 1)]
    start_publisher_room: usize,
    /// Last publisher room id; overrides --video-publishers
    #[arg(long)]
    end_publisher_room: Option<usize>,
    /// Subscribe to publishers that are already in the rooms
    #[arg(long, default_value_t = 0)]
    remote_publishers: usize,
    #[arg(long, default_value_t = 1)]
    start_remote_room: usize,
    #[arg(long)]
    end_remote_room: Option<usize>,

    #[arg(long, default_value_t = 0)]
    subscribers: usize,
    /// Subscribers per room that also publish data
    #[arg(long, default_value_t = 0)]
    data_publishers: usize,
    #[arg(long, default_value_t = 0)]
    high: usize,
    #[arg(long, default_value_t = 0)]
    medium: usize,
    #[arg(long, default_value_t = 0)]
    low: usize,

    /// Resolutions of successive publishers, e.g. "720p 1080p"
    #[arg(long, num_args = 1..)]
    resolution: Vec<String>,
    /// h264 or vp8
    #[arg(long, default_value = "h264")]
    video_codec: String,
    /// Maximum testers joining per second
    #[arg(long, default_value_t = DEFAULT_NUM_PER_SECOND)]
    num_per_second: f64,
    #[arg(long)]
    no_simulcast: bool,
    /// Put every publisher in one room
    #[arg(long)]
    same_room: bool,
    /// Publish an audio track next to each video track
    #[arg(long)]
    with_audio: bool,
    #[arg(long)]
    simulate_speakers: bool,
    /// Time between simulated speaker changes
    #[arg(long, value_parser = parse_duration, default_value = "5s")]
    speaker_interval: Duration,
    /// How long simulated speakers keep talking
    #[arg(long, value_parser = parse_duration, default_value = "2s")]
    speaking_duration: Duration,

    #[arg(long, default_value_t = DEFAULT_DATA_PACKET_BYTES)]
    data_packet_bytes: usize,
    #[arg(long, default_value_t = DEFAULT_DATA_BITRATE_KBPS)]
    data_bitrate: u64,

    /// Loopback only: probability that a forwarded packet is lost
    #[arg(long, default_value_t = 0.0)]
    loopback_packet_loss: f64,
    /// Loopback only: connect attempts that fail before connects succeed
    #[arg(long, default_value_t = 0)]
    loopback_connect_failures: u32,
    /// Loopback only: refuse identities containing this text
    #[arg(long)]
    loopback_refuse: Vec<String>,

    /// Print the report as JSON
    #[arg(long)]
    json: bool,
    /// Serve Prometheus metrics on this address
    #[arg(long, env = "ROOMLOAD_METRICS_ADDR")]
    metrics_addr: Option<SocketAddr>,
    /// Debug logging
    #[arg(short, long)]
    verbose: bool,
}

impl Args {
    fn params(&self) -> LoadTestParams {
        let mut connection = ConnectionConfig::from_env();
        if let Some(ref url) = self.url {
            connection.url = url.clone();
        }
        if let Some(ref key) = self.api_key {
            connection.api_key = key.clone();
        }
        if let Some(ref secret) = self.api_secret {
            connection.api_secret = secret.clone();
        }

        LoadTestParams {
            room: self.room.clone(),
            identity_prefix: self.id_prefix.clone(),
            duration: self.duration,
            video_publishers: self.video_publishers,
            audio_publishers: self.audio_publishers,
            start_room_number: self.start_publisher_room,
            end_room_number: self.end_publisher_room,
            remote_publishers: self.remote_publishers,
            start_remote_room_number: self.start_remote_room,
            end_remote_room_number: self.end_remote_room,
            subscribers: self.subscribers,
            data_publishers: self.data_publishers,
            high: self.high,
            medium: self.medium,
            low: self.low,
            resolutions: self.resolution.clone(),
            codec: self.video_codec.clone(),
            num_per_second: self.num_per_second,
            simulcast: !self.no_simulcast,
            same_room: self.same_room,
            with_audio: self.with_audio,
            simulate_speakers: self.simulate_speakers,
            speaker_interval: self.speaker_interval,
            speaking_duration: self.speaking_duration,
            data_packet_bytes: self.data_packet_bytes,
            data_bitrate_kbps: self.data_bitrate,
            connection,
        }
    }

    fn loopback_options(&self) -> LoopbackOptions {
        LoopbackOptions {
            packet_loss: self.loopback_packet_loss,
            connect_failures: self.loopback_connect_failures,
            refused_identities: self.loopback_refuse.clone(),
            ..Default::default()
        }
    }
}

/// Cancel the run on SIGINT or SIGTERM
fn spawn_signal_handler(cancel: CancellationToken) {
    tokio::spawn(async move {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{SignalKind, signal};
            match signal(SignalKind::terminate()) {
                Ok(mut term) => {
                    tokio::select! {
                        _ = tokio::signal::ctrl_c() => {}
                        _ = term.recv() => {}
                    }
                }
                Err(e) => {
                    warn!("Could not listen for SIGTERM: {}", e);
                    let _ = tokio::signal::ctrl_c().await;
                }
            }
        }
        #[cfg(not(unix))]
        {
            let _ = tokio::signal::ctrl_c().await;
        }
        info!("Interrupted, stopping load test");
        cancel.cancel();
    });
}

fn print_report(report: &Report, json: bool) -> anyhow::Result<()> {
    if json {
        println!("{}", report.to_json()?);
    } else {
        println!("{}", report);
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Initialize tracing
    let default_filter = if args.verbose { "roomload=debug" } else { "roomload=info" };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    if let Some(addr) = args.metrics_addr {
        PrometheusBuilder::new().with_http_listener(addr).install()?;
        info!("Prometheus metrics listening on {}", addr);
    }

    let params = args.params();
    let transport = transport_for_url(&params.connection.url, args.loopback_options())?;
    let load_test = LoadTest::from_params(params, transport)?;

    let cancel = CancellationToken::new();
    spawn_signal_handler(cancel.clone());

    match load_test.run(cancel).await {
        Ok(report) => print_report(&report, args.json),
        Err(LoadTestError::Canceled { phase, report }) => {
            print_report(&report, args.json)?;
            Err(anyhow::anyhow!("Load test canceled during {}", phase))
        }
        Err(e) => Err(e.into()),
    }
}
