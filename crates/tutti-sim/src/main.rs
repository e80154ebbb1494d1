//! tutti-sim
//!
//! Runs one leader and several followers in a single process, connected through
//! the loopback transport, and turns pages through a generated document.
//!
//! Usage:
//!   tutti-sim [--followers N] [--pages N] [--turns N]

use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use tutti_protocol::Direction;
use tutti_session::{
    channel, LoopbackHub, MemoryStore, SessionConfig, SessionCoordinator, SessionEvent,
    SessionHandle,
};

const EVENT_TIMEOUT: Duration = Duration::from_secs(10);
const PARTS: [&str; 6] = ["Viola", "Cello", "Bass", "Flute", "Oboe", "Horn"];

type BoxError = Box<dyn std::error::Error>;

struct Options {
    followers: usize,
    pages: u32,
    turns: usize,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            followers: 2,
            pages: 24,
            turns: 4,
        }
    }
}

fn print_usage() {
    eprintln!("tutti-sim - Simulate a Tutti ensemble in one process");
    eprintln!();
    eprintln!("Usage:");
    eprintln!("  tutti-sim [--followers N] [--pages N] [--turns N]");
    eprintln!();
    eprintln!("Options:");
    eprintln!("  --followers N   Number of follower devices (1-6, default 2)");
    eprintln!("  --pages N       Page count of the generated score (default 24)");
    eprintln!("  --turns N       Page turns to perform (default 4)");
    eprintln!();
    eprintln!("Environment:");
    eprintln!("  TUTTI_CACHE_DIR  Root for per-device caches (default: ./tutti-cache)");
    eprintln!("  RUST_LOG         Log filter (default: tutti_sim=info,tutti_session=info)");
}

fn parse_args(mut args: impl Iterator<Item = String>) -> Result<Options, String> {
    let mut options = Options::default();
    while let Some(flag) = args.next() {
        let mut value = |name: &str| {
            args.next()
                .ok_or_else(|| format!("{} needs a value", name))
        };
        match flag.as_str() {
            "--followers" => {
                options.followers = value("--followers")?
                    .parse()
                    .map_err(|e| format!("--followers: {}", e))?
            }
            "--pages" => {
                options.pages = value("--pages")?
                    .parse()
                    .map_err(|e| format!("--pages: {}", e))?
            }
            "--turns" => {
                options.turns = value("--turns")?
                    .parse()
                    .map_err(|e| format!("--turns: {}", e))?
            }
            other => return Err(format!("unknown argument: {}", other)),
        }
    }
    if options.followers == 0 || options.followers > PARTS.len() {
        return Err(format!("--followers must be between 1 and {}", PARTS.len()));
    }
    Ok(options)
}

struct Member {
    name: String,
    handle: SessionHandle,
}

async fn spawn_member(
    hub: &LoopbackHub,
    base: &SessionConfig,
    name: &str,
    feed: mpsc::UnboundedSender<(String, SessionEvent)>,
) -> Result<Member, BoxError> {
    let config = base
        .clone()
        .with_device_name(name)
        .with_cache_dir(base.cache_dir.join(name.to_lowercase()));
    let store = config.open_store().await?;

    let (handle, inbox) = channel();
    let transport = hub.endpoint(inbox.transport_sink());
    let (coordinator, mut events) =
        SessionCoordinator::new(config, transport, store, MemoryStore::new(), &inbox);
    tokio::spawn(coordinator.run(inbox));

    let tag = name.to_string();
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match &event {
                SessionEvent::Status(status) => info!(device = %tag, "{}", status),
                SessionEvent::PageChanged {
                    book_page,
                    slot,
                    local_page,
                } => info!(device = %tag, book_page, slot, local_page, "Showing page"),
                other => tracing::debug!(device = %tag, event = ?other),
            }
            if feed.send((tag.clone(), event)).is_err() {
                break;
            }
        }
    });

    Ok(Member {
        name: name.to_string(),
        handle,
    })
}

/// Wait until `device` reports an event matching `pred`.
async fn wait_for(
    feed: &mut mpsc::UnboundedReceiver<(String, SessionEvent)>,
    device: &str,
    mut pred: impl FnMut(&SessionEvent) -> bool,
) -> Result<SessionEvent, BoxError> {
    let wait = async {
        while let Some((from, event)) = feed.recv().await {
            if from == device && pred(&event) {
                return Some(event);
            }
        }
        None
    };
    match tokio::time::timeout(EVENT_TIMEOUT, wait).await {
        Ok(Some(event)) => Ok(event),
        Ok(None) => Err("all devices stopped".into()),
        Err(_) => Err(format!("timed out waiting for {}", device).into()),
    }
}

/// Write a small PDF-looking file with one marker per page.
fn write_score(dir: &Path, pages: u32) -> std::io::Result<PathBuf> {
    std::fs::create_dir_all(dir)?;
    let path = dir.join("ensemble-score.pdf");
    let mut contents = b"%PDF-1.7\n".to_vec();
    for page in 0..pages {
        contents.extend_from_slice(format!("% page {}\n", page + 1).as_bytes());
    }
    std::fs::write(&path, contents)?;
    Ok(path)
}

#[tokio::main]
async fn main() -> Result<(), BoxError> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tutti_sim=info,tutti_session=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let options = match parse_args(std::env::args().skip(1)) {
        Ok(options) => options,
        Err(e) => {
            eprintln!("Error: {}", e);
            eprintln!();
            print_usage();
            std::process::exit(2);
        }
    };

    let base = SessionConfig::from_env().with_service_id("tutti.sim");
    let score = write_score(&base.cache_dir, options.pages)?;
    info!(
        followers = options.followers,
        pages = options.pages,
        score = %score.display(),
        "Starting ensemble"
    );

    let hub = LoopbackHub::new();
    let (feed_tx, mut feed) = mpsc::unbounded_channel();

    let leader = spawn_member(&hub, &base, "Violin", feed_tx.clone()).await?;
    let mut followers = Vec::with_capacity(options.followers);
    for name in PARTS.iter().take(options.followers) {
        followers.push(spawn_member(&hub, &base, name, feed_tx.clone()).await?);
    }
    drop(feed_tx);

    leader.handle.load_document(&score, Some(options.pages))?;
    leader.handle.start_leading()?;
    wait_for(&mut feed, &leader.name, |e| *e == SessionEvent::AdvertisingStarted).await?;

    for follower in &followers {
        follower.handle.start_discovery()?;
        wait_for(&mut feed, &leader.name, |e| {
            matches!(e, SessionEvent::FollowerJoined(_))
        })
        .await?;
        wait_for(&mut feed, &follower.name, |e| {
            matches!(e, SessionEvent::PageChanged { .. })
        })
        .await?;
    }

    let roster = followers.len() + 1;
    let turns = options
        .turns
        .min((options.pages as usize / roster).saturating_sub(1));
    if turns < options.turns {
        info!(turns, "Score too short for every requested turn");
    }
    for turn in 0..turns {
        let requester = &followers[turn % followers.len()];
        info!(device = %requester.name, "Requesting next page");
        requester.handle.turn_page(Direction::Next)?;

        let expected = ((turn + 1) * roster) as u32;
        wait_for(&mut feed, &leader.name, |e| {
            matches!(e, SessionEvent::PageChanged { book_page, .. } if *book_page == expected)
        })
        .await?;
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    println!();
    println!("{:<8} {:>4} {:>10}", "device", "slot", "local page");
    for member in std::iter::once(&leader).chain(followers.iter()) {
        let snapshot = member.handle.snapshot().await?;
        let slot = snapshot.slot.unwrap_or(0);
        println!(
            "{:<8} {:>4} {:>10}",
            member.name,
            slot,
            tutti_protocol::arrangement::local_page(snapshot.book_page, slot) + 1
        );
    }

    leader.handle.shutdown()?;
    for follower in &followers {
        wait_for(&mut feed, &follower.name, |e| {
            *e == SessionEvent::DisconnectedFromLeader
        })
        .await?;
        follower.handle.shutdown()?;
    }
    info!("Ensemble finished");
    Ok(())
}
