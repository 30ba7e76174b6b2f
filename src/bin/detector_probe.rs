//! detector_probe - reference client for detectord.
//!
//! `control` walks the control API: list apps, register `cam1`, poll its
//! status until CONNECTED and list all sessions. `events` subscribes to the
//! MQTT mirror of the event bus and prints every detection event.

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use rumqttc::v5::mqttbytes::v5::Packet;
use rumqttc::v5::mqttbytes::QoS;
use rumqttc::v5::Event;
use std::time::{Duration, Instant};

use stream_detector::{
    api::{AppReq, ControlClient, InferenceReq},
    events::DetectionEvent,
    transport::{connect_mqtt_subscriber, MqttSettings},
    LifecycleState,
};

const DEFAULT_SETTINGS: &str =
    r#"{"width":1920,"height":1080,"fps":30,"confidence_threshold":0.5}"#;

#[derive(Parser, Debug)]
#[command(author, version, about = "Reference client for the detectord control API and event stream")]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Register a stream and poll it until it connects.
    Control {
        /// Loopback control API address.
        #[arg(long, env = "DETECTOR_API_ADDR", default_value = "127.0.0.1:50052")]
        api_addr: String,

        /// Application id; defaults to the first catalogued app.
        #[arg(long)]
        app_id: Option<String>,

        #[arg(long, default_value = "cam1")]
        stream_id: String,

        #[arg(long, default_value = "stub://cam1")]
        uri: String,

        /// Settings JSON document sent with AddInference.
        #[arg(long, default_value = DEFAULT_SETTINGS)]
        settings: String,

        /// Status polls before giving up.
        #[arg(long, default_value_t = 5)]
        polls: u32,

        /// Delay between status polls in milliseconds.
        #[arg(long, default_value_t = 2000)]
        poll_interval_ms: u64,

        /// Remove the stream again before exiting.
        #[arg(long)]
        remove: bool,
    },
    /// Print detection events mirrored to MQTT.
    Events {
        #[arg(long, env = "DETECTOR_MQTT_BROKER", default_value = "127.0.0.1:1883")]
        broker: String,

        /// MQTT topic filter.
        #[arg(long, default_value = "stream/#")]
        topic: String,

        /// Stop after this many seconds (0 runs until Ctrl-C).
        #[arg(long, default_value_t = 30)]
        duration_secs: u64,

        #[arg(long)]
        allow_remote: bool,
    },
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();
    match args.command {
        Command::Control {
            api_addr,
            app_id,
            stream_id,
            uri,
            settings,
            polls,
            poll_interval_ms,
            remove,
        } => run_control(ControlOptions {
            api_addr,
            app_id,
            stream_id,
            uri,
            settings,
            polls,
            poll_interval: Duration::from_millis(poll_interval_ms),
            remove,
        }),
        Command::Events {
            broker,
            topic,
            duration_secs,
            allow_remote,
        } => {
            let mut settings = MqttSettings::new(&broker);
            settings.client_id = format!("detector_probe-{}", std::process::id());
            settings.allow_remote = allow_remote;
            let duration = (duration_secs > 0).then(|| Duration::from_secs(duration_secs));
            run_events(&settings, &topic, duration)
        }
    }
}

struct ControlOptions {
    api_addr: String,
    app_id: Option<String>,
    stream_id: String,
    uri: String,
    settings: String,
    polls: u32,
    poll_interval: Duration,
    remove: bool,
}

fn run_control(opts: ControlOptions) -> Result<()> {
    let client = ControlClient::new(&opts.api_addr)?;

    println!("=== GetAppList ===");
    let apps = client.get_app_list(&AppReq::default())?;
    println!("Apps: {}", apps.app.len());
    for app in &apps.app {
        println!("  - {}: {}", app.id, app.name);
        for model in &app.models {
            println!("    Model: {} ({})", model.name, model.path);
        }
    }
    let app_id = match opts.app_id {
        Some(id) => id,
        None => match apps.app.first() {
            Some(app) => app.id.clone(),
            None => {
                println!("No apps registered!");
                return Ok(());
            }
        },
    };

    println!("\n=== AddInference ===");
    let res = client.add_inference(&InferenceReq {
        app_id,
        stream_id: opts.stream_id.clone(),
        uri: opts.uri,
        settings: opts.settings,
    })?;
    println!("count={}, status={}, err={}", res.count, res.status, res.err);
    if let Some(meta) = &res.meta {
        println!("meta={}", meta);
    }

    println!("\n=== GetInferenceStatus ===");
    for i in 1..=opts.polls {
        std::thread::sleep(opts.poll_interval);
        let res = client.get_inference_status(&InferenceReq::stream(&opts.stream_id))?;
        let state = res
            .state()
            .map(|s| s.name().to_string())
            .unwrap_or_else(|| res.status.to_string());
        println!("[{}] status={}, err={}", i, state, res.err);
        if res.state() == Some(LifecycleState::Connected) {
            println!("Stream is connected!");
            break;
        }
    }

    println!("\n=== GetInferenceList ===");
    let list = client.get_inference_list(&InferenceReq::default())?;
    println!("Inferences: {}", list.inferences.len());
    for inf in &list.inferences {
        println!(
            "  - {}: status={}, fps={:.1}, frames={}",
            inf.stream_id, inf.status, inf.current_fps, inf.frame_count
        );
    }

    if opts.remove {
        println!("\n=== RemoveInference ===");
        let res = client.remove_inference(&InferenceReq::stream(&opts.stream_id))?;
        println!("count={}, err={}", res.count, res.err);
    }
    Ok(())
}

fn run_events(settings: &MqttSettings, topic: &str, duration: Option<Duration>) -> Result<()> {
    let (client, mut connection) = connect_mqtt_subscriber(settings)?;
    client
        .subscribe(topic, QoS::AtLeastOnce)
        .with_context(|| format!("failed to subscribe to {}", topic))?;
    println!("Subscribed to {} on {}", topic, settings.broker_addr);
    println!("Waiting for messages... (Ctrl+C to stop)");

    let started = Instant::now();
    let mut received = 0u64;
    loop {
        if duration.is_some_and(|d| started.elapsed() >= d) {
            break;
        }
        let event = match connection.recv_timeout(Duration::from_millis(500)) {
            Ok(Ok(event)) => event,
            Ok(Err(err)) => return Err(anyhow!("MQTT connection error: {}", err)),
            Err(_) => continue,
        };
        let Event::Incoming(Packet::Publish(publish)) = event else {
            continue;
        };
        received += 1;
        let topic = String::from_utf8_lossy(&publish.topic).to_string();
        match serde_json::from_slice::<DetectionEvent>(&publish.payload) {
            Ok(event) => print_event(&topic, &event),
            Err(err) => log::warn!("unparseable payload on {}: {}", topic, err),
        }
    }

    client.disconnect()?;
    println!("\nDisconnected after {} messages", received);
    Ok(())
}

fn print_event(topic: &str, event: &DetectionEvent) {
    println!("\n=== {} ===", topic);
    println!("  stream_id: {}", event.stream_id);
    println!("  timestamp: {}", event.timestamp);
    println!("  frame_number: {}", event.frame_number);
    println!("  fps: {:.2}", event.fps);
    println!("  size: {}x{}", event.width, event.height);
    println!("  detections: {}", event.detections.len());
    if let Some(image) = &event.image_base64 {
        println!("  image_size: {} bytes", image.len());
    }
    for det in event.detections.iter().take(3) {
        println!("    - {}: {:.2}%", det.class, det.confidence * 100.0);
    }
}
