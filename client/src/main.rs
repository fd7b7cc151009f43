use clap::Parser;
use client::network::Client;
use log::{info, warn};
use rand::Rng;
use shared::{Pose, Quaternion, SceneObject, Vector3, VOICE_FRAME_COUNT, VOICE_FRAME_MAX};
use std::time::{Duration, Instant};
use tokio::time::{interval, MissedTickBehavior};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Server address to connect to
    #[arg(short = 's', long, default_value = "127.0.0.1:8080")]
    server: String,

    /// Pose updates per second
    #[arg(short = 'r', long, default_value = "30")]
    rate: u32,

    /// Text to send once connected
    #[arg(short = 'e', long)]
    echo: Option<String>,

    /// Shared object to claim and carry around
    #[arg(short = 'o', long)]
    object: Option<String>,

    /// How long to stay in the session
    #[arg(short = 'd', long, default_value = "10")]
    duration_secs: u64,

    /// Print the final participant view as JSON
    #[arg(long)]
    dump_state: bool,
}

/// Head pose of a participant gently swaying in place
fn sway(t: f32) -> Pose {
    Pose::new(
        Vector3::new((t * 0.8).sin() * 0.1, 1.6 + (t * 1.3).sin() * 0.02, 0.0),
        Quaternion::from_yaw((t * 0.5).sin() * 0.4),
    )
}

/// Stand-in for microphone output: random bytes shaped like codec frames
fn random_voice_frames(rng: &mut impl Rng) -> Vec<Vec<u8>> {
    let count = rng.gen_range(1..=VOICE_FRAME_COUNT);
    (0..count)
        .map(|_| {
            let len = rng.gen_range(8..=VOICE_FRAME_MAX);
            (0..len).map(|_| rng.gen()).collect()
        })
        .collect()
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    if std::env::var("RUST_LOG").is_err() {
        eprintln!("Set RUST_LOG=info for detailed logging");
    }

    let args = Args::parse();

    info!("Starting client...");
    info!("Connecting to: {}", args.server);

    let mut client = Client::new(&args.server).await?;
    let session = client.connect(Duration::from_secs(5)).await?;

    if let Some(text) = &args.echo {
        client.send_echo(text).await?;
    }

    let mut held = args.object.as_deref().map(SceneObject::new);
    if let Some(object) = &held {
        client.claim_object(object).await?;
    }

    let mut rng = rand::thread_rng();
    let mut ticker = interval(Duration::from_secs_f32(1.0 / args.rate.max(1) as f32));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let started = Instant::now();
    let run_for = Duration::from_secs(args.duration_secs);
    let mut tick: u64 = 0;

    while started.elapsed() < run_for && client.view().is_connected() {
        ticker.tick().await;
        tick += 1;

        let t = started.elapsed().as_secs_f32();
        let head = sway(t);
        client.send_head_pose(head).await?;

        if tick % 3 == 0 {
            let frames = random_voice_frames(&mut rng);
            let frames: Vec<&[u8]> = frames.iter().map(Vec::as_slice).collect();
            client.send_voice_frames(&frames).await?;
        }

        if let Some(object) = held.as_mut() {
            if client.view().owner_of(&object.id) == session {
                object.position = Vector3::new(head.position.x, 1.0, -0.4);
                object.orientation = head.orientation;
                client.update_object(object).await?;
            }
        }

        client.poll(Duration::ZERO).await?;
    }

    if let Some(object) = &held {
        match client.view().owner_of(&object.id) {
            owner if owner == session => client.release_object(object).await?,
            owner => warn!("Never got {:?}; owned by session {}", object.id, owner),
        }
    }

    client.disconnect().await?;
    info!(
        "Left after {:.1}s, {} packets received",
        started.elapsed().as_secs_f32(),
        client.packets_received()
    );

    if args.dump_state {
        println!("{}", client.view().to_json()?);
    }

    Ok(())
}
