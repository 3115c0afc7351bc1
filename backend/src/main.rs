use std::{net::SocketAddr, path::PathBuf, sync::Arc, time::Duration};

use clap::{Args, Parser, Subcommand};
use convoy::{
    config::{NavigationSettings, RoutingSettings, SearchSettings, VoiceSettings},
    controller::ConvoyController,
    create_router,
    error::Advisory,
    geolocation::{GpxReplay, WatchOptions},
    gpx_export::write_trip_gpx,
    models::{Coordinate, Destination, Role},
    routing::{OsrmClient, RouteProvider},
    runtime::ConvoyRuntime,
    search::{DestinationSearch, GeminiSuggestions, SearchOutcome},
    store::TripStore,
    voice::{LogSpeech, VoiceGuide},
    AppState,
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(author, version, about = "Convoy following: one leader, many followers")]
struct Cli {
    /// JSON file holding every trip record
    #[arg(long, env = "CONVOY_STORE", default_value = "convoy-trips.json", global = true)]
    store: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Serve the trip API over HTTP
    Serve {
        #[arg(long, env = "CONVOY_ADDR", default_value = "0.0.0.0:8080")]
        addr: SocketAddr,
    },
    /// Replay a GPX track as the convoy leader
    Lead(LeadArgs),
    /// Join a convoy and report the leader's position
    Follow {
        #[arg(long)]
        code: String,
    },
    /// Suggest destinations for a free-text query
    Search {
        query: String,
        #[arg(long, requires = "near_lng")]
        near_lat: Option<f64>,
        #[arg(long, requires = "near_lat")]
        near_lng: Option<f64>,
        #[arg(long, env = "GEMINI_API_KEY", hide_env_values = true)]
        api_key: Option<String>,
    },
    /// Write a trip's recorded path as GPX
    Export {
        #[arg(long)]
        code: String,
        #[arg(long)]
        output: PathBuf,
    },
}

#[derive(Debug, Args)]
struct LeadArgs {
    /// GPX track standing in for the device location
    #[arg(long)]
    track: PathBuf,
    #[arg(long, allow_negative_numbers = true)]
    dest_lat: f64,
    #[arg(long, allow_negative_numbers = true)]
    dest_lng: f64,
    #[arg(long, default_value = "Destination")]
    dest_name: String,
    /// Delay between replayed fixes
    #[arg(long, default_value_t = 1000)]
    interval_ms: u64,
    /// Leave the trip active when the track ends
    #[arg(long)]
    keep_active: bool,
    #[arg(long)]
    no_voice: bool,
    #[arg(long, env = "OSRM_URL", default_value = "https://router.project-osrm.org")]
    osrm_url: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "convoy=debug,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::Serve { addr } => serve(cli.store, addr).await,
        Command::Lead(args) => lead(cli.store, args).await,
        Command::Follow { code } => follow(cli.store, &code).await,
        Command::Search {
            query,
            near_lat,
            near_lng,
            api_key,
        } => {
            let near = near_lat.zip(near_lng).map(|(lat, lng)| Coordinate::new(lat, lng));
            search(&query, near, api_key).await;
            Ok(())
        }
        Command::Export { code, output } => export(cli.store, &code, output),
    }
}

async fn serve(store: PathBuf, addr: SocketAddr) -> Result<(), Box<dyn std::error::Error>> {
    let state = AppState {
        store: Arc::new(TripStore::open(store)?),
    };
    let app = create_router(state);

    tracing::info!("starting trip API on http://{addr}");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

fn runtime_for(store: Arc<TripStore>, routing: &RoutingSettings, voice_on: bool) -> ConvoyRuntime {
    let voice = VoiceGuide::new(Box::new(LogSpeech), VoiceSettings::default());
    let mut controller = ConvoyController::new(store, voice, NavigationSettings::default());
    controller.set_voice_enabled(voice_on);
    let routes = Arc::new(RouteProvider::new(Arc::new(OsrmClient::new(routing)), routing));
    ConvoyRuntime::new(controller, routes, WatchOptions::default())
}

async fn lead(store: PathBuf, args: LeadArgs) -> Result<(), Box<dyn std::error::Error>> {
    let store = Arc::new(TripStore::open(store)?);
    let routing = RoutingSettings {
        base_url: args.osrm_url.clone(),
        ..RoutingSettings::default()
    };
    let mut runtime = runtime_for(store, &routing, !args.no_voice);

    let replay = GpxReplay::from_path(&args.track, Duration::from_millis(args.interval_ms))?;
    tracing::info!("replaying {} fixes from {:?}", replay.points().len(), args.track);
    let mut positions = replay.spawn();

    runtime.select_destination(Destination {
        lat: args.dest_lat,
        lng: args.dest_lng,
        name: args.dest_name,
        address: None,
    })?;

    let mut started = false;
    let mut last_advisory: Option<Advisory> = None;
    while runtime.step(&mut positions).await {
        if !started && runtime.session().has_route() && !runtime.controller().is_fetching_route() {
            let trip = runtime.start_convoy()?;
            tracing::info!("convoy started, share code {}", trip.code);
            started = true;
        }
        let advisory = runtime.session().advisory.clone();
        if advisory != last_advisory {
            if let Some(advisory) = &advisory {
                tracing::warn!("{advisory}");
            }
            last_advisory = advisory;
        }
    }
    // Let a pending route fetch or step timer land before wrapping up.
    runtime.settle(Duration::from_secs(5)).await;

    if runtime.session().role == Role::Leader && !args.keep_active {
        let trip = runtime.finalize()?;
        tracing::info!("track ended, convoy {} finalized", trip.code);
    } else {
        runtime.leave();
    }
    Ok(())
}

async fn follow(store: PathBuf, code: &str) -> Result<(), Box<dyn std::error::Error>> {
    let store = Arc::new(TripStore::open(store)?);
    let mut runtime = runtime_for(store, &RoutingSettings::default(), true);
    runtime.join_convoy(code)?;

    let mut last_seen = None;
    loop {
        let session = runtime.session();
        if let Some(leader) = session.leader_position.filter(|p| Some(p.timestamp) != last_seen) {
            tracing::info!(
                "leader at {:.5}, {:.5} (route of {} points)",
                leader.lat,
                leader.lng,
                session.route.len()
            );
            last_seen = Some(leader.timestamp);
        }
        if let Some(advisory) = &session.advisory {
            tracing::warn!("{advisory}");
            if *advisory == Advisory::TripEnded {
                break;
            }
        }

        tokio::select! {
            _ = runtime.step_internal() => {}
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("leaving convoy");
                break;
            }
        }
    }
    runtime.leave();
    Ok(())
}

async fn search(query: &str, near: Option<Coordinate>, api_key: Option<String>) {
    let settings = SearchSettings {
        api_key,
        ..SearchSettings::default()
    };
    let search = DestinationSearch::new(Arc::new(GeminiSuggestions::new(&settings)), &settings);

    match search.search(query, near, None).await {
        SearchOutcome::Suggestions(found) if found.is_empty() => println!("no suggestions"),
        SearchOutcome::Suggestions(found) => {
            for destination in found {
                println!(
                    "{:.5}, {:.5}  {}  {}",
                    destination.lat,
                    destination.lng,
                    destination.name,
                    destination.address.unwrap_or_default()
                );
            }
        }
        SearchOutcome::Cleared | SearchOutcome::Superseded => {
            println!("query too short, type at least {} characters", settings.min_query_len)
        }
    }
}

fn export(store: PathBuf, code: &str, output: PathBuf) -> Result<(), Box<dyn std::error::Error>> {
    let store = TripStore::open(store)?;
    let trip = store.get_trip_by_code(code)?;
    let file = std::fs::File::create(&output)?;
    write_trip_gpx(&trip, std::io::BufWriter::new(file))?;
    tracing::info!(
        "wrote {} points of convoy {} to {:?}",
        trip.path.len(),
        trip.code,
        output
    );
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::warn!("failed to listen for shutdown signal: {err}");
    }
}
