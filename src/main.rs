use std::{path::PathBuf, time::Duration};

use anyhow::{Context, Result, anyhow, bail};
use chrono::Utc;
use clap::{Parser, Subcommand};
use dialoguer::{Confirm, FuzzySelect, Password, Select, theme::ColorfulTheme};
use reqwest::Client;
use tracing_subscriber::EnvFilter;

use aniverse::{
    catalog::Catalog,
    clips::{ClipRecorder, FfmpegCapture, MAX_CLIP_SECONDS},
    config::Settings,
    downloads::{DownloadItem, DownloadManager, DownloadOutcome, HttpTransport},
    history::WatchHistory,
    music::Playlist,
    player::{
        MediaElement, MediaEvent, MpvElement, PlayOutcome, PlayerSession, SKIP_OPENING_KEY,
        episode_now_playing,
    },
    profiles::{Avatar, Background, NewProfile, Profile, ProfileError, ProfileManager, ProfilePatch, StartupState},
    proxy::{LocalMediaProxy, MediaRoutes},
    ratings::{Ratings, Vote, rating_key},
    store::{KvStore, Theme},
    types::{Anime, AnimeKind, StreamOption},
};

const PASSWORD_ATTEMPTS: usize = 3;

#[derive(Debug, Parser)]
#[command(
    name = "aniverse",
    about = "Browse and watch anime with profiles, offline downloads and clips.",
    version
)]
struct Cli {
    /// Settings file (defaults to the user config directory).
    #[arg(long, value_name = "FILE", global = true)]
    config: Option<PathBuf>,

    /// Catalog JSON path or URL, overriding the configured one.
    #[arg(long, value_name = "PATH_OR_URL", global = true)]
    catalog: Option<String>,

    /// Skip openings automatically instead of waiting for the skip key.
    #[arg(long, global = true)]
    skip_openings: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// List the catalog and pick something to watch.
    Browse {
        #[arg(long, value_name = "TYPE")]
        kind: Option<String>,
        #[arg(value_name = "QUERY")]
        query: Vec<String>,
    },
    /// Play an episode in the configured player.
    Watch {
        #[arg(value_name = "ANIME_ID")]
        id: Option<String>,
        #[arg(short, long)]
        season: Option<u32>,
        /// 1-based episode number.
        #[arg(short, long)]
        episode: Option<usize>,
    },
    /// Continue watching.
    History {
        /// Drop an anime from the shared continue-watching list.
        #[arg(long, value_name = "ANIME_ID")]
        remove: Option<String>,
    },
    /// Play an anime's soundtrack.
    Music {
        #[arg(value_name = "ANIME_ID")]
        id: String,
    },
    Profile {
        #[command(subcommand)]
        action: ProfileCommand,
    },
    Download {
        #[command(subcommand)]
        action: DownloadCommand,
    },
    Clip {
        #[command(subcommand)]
        action: ClipCommand,
    },
    /// Like or dislike an episode; shows the tally without a vote.
    Rate {
        id: String,
        season: u32,
        episode: usize,
        #[arg(value_enum)]
        vote: Option<Vote>,
    },
    Theme {
        #[arg(value_enum)]
        theme: Option<Theme>,
    },
    /// Serve the catalog and media through the offline cache.
    Serve {
        #[arg(long)]
        port: Option<u16>,
    },
    Config {
        #[command(subcommand)]
        action: ConfigCommand,
    },
}

#[derive(Debug, Subcommand)]
enum ProfileCommand {
    List,
    Create {
        name: String,
        #[arg(long, default_value = "")]
        pronoun: String,
        #[arg(long, value_name = "HEX")]
        color: Option<String>,
        #[arg(long)]
        character: Option<String>,
        /// Prompt for a password.
        #[arg(long)]
        password: bool,
    },
    Select {
        id: Option<String>,
    },
    Edit {
        id: String,
        #[arg(long)]
        name: Option<String>,
        #[arg(long)]
        pronoun: Option<String>,
        #[arg(long, value_name = "HEX")]
        color: Option<String>,
        #[arg(long, conflicts_with = "clear_password")]
        password: bool,
        #[arg(long)]
        clear_password: bool,
    },
    Delete {
        id: String,
    },
    /// Continue as a guest.
    Logout,
}

#[derive(Debug, Subcommand)]
enum DownloadCommand {
    Episode {
        id: String,
        season: u32,
        episode: usize,
    },
    Season {
        id: String,
        season: u32,
    },
    Music {
        id: String,
        /// 1-based track number; every track when omitted.
        #[arg(long)]
        track: Option<usize>,
    },
    List,
    Remove {
        key: String,
    },
    Clear,
    /// Reconcile download records with the offline cache.
    Repair,
}

#[derive(Debug, Subcommand)]
enum ClipCommand {
    /// Record up to a minute of an episode starting at its saved position.
    Record {
        id: String,
        season: u32,
        episode: usize,
        #[arg(long, value_name = "SECONDS")]
        at: Option<f64>,
        #[arg(long, value_name = "SECONDS", default_value_t = MAX_CLIP_SECONDS as u64)]
        length: u64,
    },
    List,
    Remove {
        id: String,
    },
    Clear,
}

#[derive(Debug, Subcommand)]
enum ConfigCommand {
    /// Write the default settings file.
    Init {
        #[arg(long)]
        force: bool,
    },
    Show,
}

struct App {
    settings: Settings,
    store: KvStore,
    profiles: ProfileManager,
    history: WatchHistory,
    http: Client,
    skip_openings: bool,
}

impl App {
    fn new(settings: Settings, skip_openings: bool) -> Result<Self> {
        let store = KvStore::open(settings.store_dir());
        let http = Client::builder()
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self {
            profiles: ProfileManager::new(store.clone()),
            history: WatchHistory::new(store.clone()),
            store,
            settings,
            http,
            skip_openings,
        })
    }

    async fn catalog(&self) -> Result<Catalog> {
        let mut catalog = Catalog::new();
        catalog.subscribe(|anime| tracing::debug!(count = anime.len(), "catalog ready"));
        let count = catalog.load(&self.settings.catalog, &self.http).await;
        if count == 0 {
            bail!(
                "Catalog at {} is empty or unreadable. Pass --catalog or set `catalog` in the settings file.",
                self.settings.catalog
            );
        }
        Ok(catalog)
    }

    fn downloads(&self) -> Result<DownloadManager<HttpTransport>> {
        let transport = HttpTransport::new().context("failed to build download client")?;
        let mut manager =
            DownloadManager::new(self.store.clone(), self.settings.offline_cache(), transport);
        manager.on_state_change(|key, state| eprint!("\r{key}: {:<16}", state.label()));
        Ok(manager)
    }

    fn clip_recorder(&self) -> ClipRecorder<FfmpegCapture> {
        let backend = FfmpegCapture::new(self.settings.ffmpeg.clone(), self.settings.capture_dir());
        ClipRecorder::new(self.store.clone(), backend)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("aniverse=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let result = run().await;
    if let Err(err) = &result {
        eprintln!("error: {err:?}");
    }
    result
}

async fn run() -> Result<()> {
    let cli = Cli::parse();
    let config_path = cli.config.clone().unwrap_or_else(Settings::config_path);

    if let Some(Command::Config { action }) = &cli.command {
        return run_config(action, &config_path);
    }

    let mut settings = Settings::load_from(Some(&config_path), None)
        .with_context(|| format!("failed to load settings from {}", config_path.display()))?;
    if let Some(catalog) = cli.catalog {
        settings.catalog = catalog;
    }
    let app = App::new(settings, cli.skip_openings)?;

    match cli.command.unwrap_or(Command::Browse {
        kind: None,
        query: Vec::new(),
    }) {
        Command::Browse { kind, query } => {
            resolve_profile(&app.profiles)?;
            browse(&app, kind.as_deref(), &query.join(" ")).await
        }
        Command::Watch {
            id,
            season,
            episode,
        } => {
            resolve_profile(&app.profiles)?;
            let catalog = app.catalog().await?;
            let anime = match id {
                Some(id) => find_anime(&catalog, &id)?.clone(),
                None => match choose_anime(catalog.sorted_by_title())? {
                    Some(anime) => anime,
                    None => return Ok(()),
                },
            };
            watch(&app, &anime, season, episode.map(|e| e.saturating_sub(1))).await
        }
        Command::History { remove } => {
            if let Some(id) = remove {
                app.history
                    .remove_continue_watching(&id)
                    .context("failed to update continue watching")?;
                println!("Removed {id} from continue watching.");
                return Ok(());
            }
            resolve_profile(&app.profiles)?;
            resume_from_history(&app).await
        }
        Command::Music { id } => {
            let catalog = app.catalog().await?;
            play_soundtrack(&app, find_anime(&catalog, &id)?).await
        }
        Command::Profile { action } => run_profile(&app.profiles, action),
        Command::Download { action } => run_download(&app, action).await,
        Command::Clip { action } => run_clip(&app, action).await,
        Command::Rate {
            id,
            season,
            episode,
            vote,
        } => {
            let ratings = Ratings::new(app.store.clone());
            let key = rating_key(&id, season, episode.saturating_sub(1));
            let (counts, mine) = match vote {
                Some(vote) => ratings.rate(&key, vote).context("failed to save rating")?,
                None => (ratings.counts(&key), ratings.user_vote(&key)),
            };
            let mine = match mine {
                Some(Vote::Like) => "liked",
                Some(Vote::Dislike) => "disliked",
                None => "no vote",
            };
            println!("{} likes · {} dislikes ({mine})", counts.likes, counts.dislikes);
            Ok(())
        }
        Command::Theme { theme } => {
            if let Some(theme) = theme {
                app.store.set_theme(theme).context("failed to save theme")?;
            }
            println!("Theme: {:?}", app.store.theme());
            Ok(())
        }
        Command::Serve { port } => serve(&app, port).await,
        Command::Config { .. } => Ok(()),
    }
}

fn run_config(action: &ConfigCommand, path: &std::path::Path) -> Result<()> {
    match action {
        ConfigCommand::Init { force } => {
            Settings::write_default(path, *force)
                .with_context(|| format!("failed to write settings to {}", path.display()))?;
            println!("Wrote {}", path.display());
        }
        ConfigCommand::Show => {
            let settings = Settings::load_from(Some(path), None)?;
            println!("# {}", path.display());
            print!(
                "{}",
                toml::to_string_pretty(&settings).context("failed to render settings")?
            );
        }
    }
    Ok(())
}

/// Settles who is watching before anything records progress.
fn resolve_profile(profiles: &ProfileManager) -> Result<Option<Profile>> {
    match profiles.startup_state()? {
        StartupState::NoProfiles => {
            tracing::debug!("no profiles, using shared history");
            Ok(None)
        }
        StartupState::Active(profile) => Ok(Some(profile)),
        StartupState::AutoActivated(profile) => {
            println!("Watching as {}.", profile.display_name());
            Ok(Some(profile))
        }
        StartupState::SelectionRequired(list) => choose_profile(profiles, &list),
    }
}

fn choose_profile(profiles: &ProfileManager, list: &[Profile]) -> Result<Option<Profile>> {
    let items: Vec<String> = list
        .iter()
        .map(|p| {
            if p.is_locked() {
                format!("{} (locked)", p.display_name())
            } else {
                p.display_name()
            }
        })
        .collect();
    let selection = Select::with_theme(&theme())
        .with_prompt("Who's watching? (Esc for guest)")
        .items(&items)
        .default(0)
        .interact_opt()?;
    let Some(idx) = selection else {
        println!("Continuing as guest.");
        return Ok(None);
    };
    let profile = &list[idx];
    if !profile.is_locked() {
        return Ok(profiles.set_active_profile(&profile.id)?);
    }
    for _ in 0..PASSWORD_ATTEMPTS {
        let attempt = Password::with_theme(&theme())
            .with_prompt(format!("Password for {}", profile.name))
            .interact()?;
        match profiles.activate_with_password(&profile.id, Some(&attempt)) {
            Ok(profile) => return Ok(Some(profile)),
            Err(ProfileError::WrongPassword) => println!("Wrong password."),
            Err(err) => return Err(err.into()),
        }
    }
    bail!("Too many wrong passwords for {}", profile.name)
}

async fn browse(app: &App, kind: Option<&str>, query: &str) -> Result<()> {
    let catalog = app.catalog().await?;
    let mut shown: Vec<&Anime> = match kind {
        Some(kind) => catalog.by_type(&AnimeKind::from(kind.to_string())),
        None => catalog.sorted_by_title(),
    };
    if !query.trim().is_empty() {
        let hits = catalog.search(query);
        shown.retain(|a| hits.iter().any(|h| h.id == a.id));
    }
    if shown.is_empty() {
        println!("Nothing matches.");
        return Ok(());
    }
    let Some(anime) = choose_anime(shown)? else {
        return Ok(());
    };
    watch(app, &anime, None, None).await
}

fn choose_anime(list: Vec<&Anime>) -> Result<Option<Anime>> {
    let items: Vec<String> = list
        .iter()
        .map(|a| {
            let year = a.year.map(|y| format!(" {y}")).unwrap_or_default();
            format!(
                "{} [{}{year}] · {} episodes",
                a.title,
                a.kind.label(),
                a.episode_count()
            )
        })
        .collect();
    let selection = FuzzySelect::with_theme(&theme())
        .with_prompt("Select an anime (Esc to cancel)")
        .items(&items)
        .default(0)
        .interact_opt()?;
    Ok(selection.map(|idx| list[idx].clone()))
}

fn find_anime<'a>(catalog: &'a Catalog, id: &str) -> Result<&'a Anime> {
    catalog
        .get(id)
        .ok_or_else(|| anyhow!("No anime with id {id} in the catalog"))
}

async fn watch(
    app: &App,
    anime: &Anime,
    season: Option<u32>,
    episode: Option<usize>,
) -> Result<()> {
    let saved = app.history.position(&anime.id);
    let season = match season {
        Some(season) => season,
        None => match choose_season(anime, saved.map(|p| p.season))? {
            Some(season) => season,
            None => return Ok(()),
        },
    };
    let episode = match episode {
        Some(episode) => episode,
        None => {
            let resume = saved.filter(|p| p.season == season).map(|p| p.episode);
            match choose_episode(app, anime, season, resume)? {
                Some(episode) => episode,
                None => return Ok(()),
            }
        }
    };

    let streams = anime
        .episode(season, episode)
        .map(|ep| ep.streams())
        .unwrap_or_default();
    let quality = if streams.is_empty() {
        None
    } else {
        Some(choose_stream(streams)?.quality_label)
    };

    let element = MpvElement::new(app.settings.player_command()?);
    let mut session = PlayerSession::new(element, app.history.clone(), app.profiles.clone())
        .with_offline_cache(app.settings.offline_cache())
        .with_quality(quality);
    let opened = session.open_episode(anime, season, episode).await?;
    println!(
        "Playing {}{}{}",
        opened.now_playing.display_title(),
        opened
            .resumed_at
            .map(|t| format!(" from {}", format_clock(t)))
            .unwrap_or_default(),
        if opened.offline { " (offline)" } else { "" }
    );
    if let PlayOutcome::Failed(reason) = opened.outcome {
        bail!("Playback failed: {reason}");
    }
    if !app.skip_openings {
        println!("Press '{SKIP_OPENING_KEY}' in the player to skip an opening.");
    }
    session.run(app.skip_openings).await?;
    println!("Player closed.");
    Ok(())
}

fn choose_stream(mut options: Vec<StreamOption>) -> Result<StreamOption> {
    if options.len() == 1 {
        return Ok(options.remove(0));
    }
    let labels: Vec<String> = options.iter().map(StreamOption::label).collect();
    let selection = Select::with_theme(&theme())
        .with_prompt("Select a stream")
        .items(&labels)
        .default(0)
        .interact_opt()?;
    let Some(idx) = selection else {
        bail!("Stream selection cancelled.");
    };
    Ok(options.remove(idx))
}

fn choose_season(anime: &Anime, preferred: Option<u32>) -> Result<Option<u32>> {
    let numbers = anime.season_numbers();
    match numbers.as_slice() {
        [] => bail!("{} has no episodes", anime.title),
        [only] => return Ok(Some(*only)),
        _ => {}
    }
    let items: Vec<String> = numbers
        .iter()
        .map(|n| {
            let season = anime.season(*n);
            let count = season.map_or(0, |s| s.episodes.len());
            match season.and_then(|s| s.title.as_deref()) {
                Some(title) => format!("Season {n}: {title} ({count} episodes)"),
                None => format!("Season {n} ({count} episodes)"),
            }
        })
        .collect();
    let default = preferred
        .and_then(|p| numbers.iter().position(|n| *n == p))
        .unwrap_or(0);
    let selection = Select::with_theme(&theme())
        .with_prompt("Season (Esc to cancel)")
        .items(&items)
        .default(default)
        .interact_opt()?;
    Ok(selection.map(|idx| numbers[idx]))
}

fn choose_episode(
    app: &App,
    anime: &Anime,
    season: u32,
    resume: Option<usize>,
) -> Result<Option<usize>> {
    let episodes = anime
        .season(season)
        .map(|s| s.episodes.as_slice())
        .unwrap_or_default();
    if episodes.is_empty() {
        bail!("{} season {season} has no episodes", anime.title);
    }
    let items: Vec<String> = episodes
        .iter()
        .enumerate()
        .map(|(idx, ep)| {
            let mark = if app.history.is_watched(&anime.id, season, idx) {
                "✓"
            } else {
                " "
            };
            let title = if ep.title.is_empty() {
                format!("Episode {}", idx + 1)
            } else {
                format!("{}. {}", idx + 1, ep.title)
            };
            format!("{mark} {title}")
        })
        .collect();
    let selection = Select::with_theme(&theme())
        .with_prompt("Episode (Esc to cancel)")
        .items(&items)
        .default(resume.unwrap_or(0).min(episodes.len() - 1))
        .interact_opt()?;
    Ok(selection)
}

async fn resume_from_history(app: &App) -> Result<()> {
    let entries = match app.profiles.active_profile() {
        Some(profile) => profile.continue_watching,
        None => app.history.continue_watching(),
    };
    if entries.is_empty() {
        println!("Nothing to continue.");
        return Ok(());
    }
    let items: Vec<String> = entries.iter().map(|entry| entry.label()).collect();
    let selection = Select::with_theme(&theme())
        .with_prompt("Continue watching (Esc to cancel)")
        .items(&items)
        .default(0)
        .interact_opt()?;
    let Some(idx) = selection else {
        return Ok(());
    };
    let entry = &entries[idx];
    let catalog = app.catalog().await?;
    let anime = find_anime(&catalog, &entry.anime_id)?;
    watch(app, anime, Some(entry.season), Some(entry.episode)).await
}

async fn play_soundtrack(app: &App, anime: &Anime) -> Result<()> {
    let mut playlist = Playlist::new(anime.music.clone());
    if playlist.tracks().is_empty() {
        bail!("{} has no soundtrack", anime.title);
    }
    let items: Vec<String> = playlist
        .tracks()
        .iter()
        .map(|t| match &t.artist {
            Some(artist) => format!("{} · {artist}", t.title),
            None => t.title.clone(),
        })
        .collect();
    let selection = Select::with_theme(&theme())
        .with_prompt("Track (Esc to cancel)")
        .items(&items)
        .default(0)
        .interact_opt()?;
    let Some(start) = selection else {
        return Ok(());
    };
    playlist.select(start);

    let cache = app.settings.offline_cache();
    let mut element = MpvElement::new(app.settings.player_command()?);
    loop {
        let Some(now) = playlist.now_playing() else {
            return Ok(());
        };
        let remote = now.source.clone().unwrap_or_default();
        let source = cache
            .blob_url(&remote)
            .map(|u| u.to_string())
            .unwrap_or(remote);
        println!("♪ {}", now.display_title());
        element.set_source(&source, &now.display_title());
        element.play().await?;
        let mut ended = false;
        while let Some(event) = element.next_event().await {
            if event == MediaEvent::Ended {
                ended = true;
                break;
            }
        }
        if !ended || playlist.next().is_none() || playlist.current_index() == Some(start) {
            return Ok(());
        }
    }
}

fn run_profile(profiles: &ProfileManager, action: ProfileCommand) -> Result<()> {
    match action {
        ProfileCommand::List => {
            let active = profiles.active_profile_id();
            let list = profiles.list_profiles();
            if list.is_empty() {
                println!("No profiles.");
            }
            for profile in list {
                let marker = if active.as_deref() == Some(profile.id.as_str()) {
                    "*"
                } else {
                    " "
                };
                let lock = if profile.is_locked() { " (locked)" } else { "" };
                println!(
                    "{marker} {}  {}{lock} · {} in progress",
                    profile.id,
                    profile.display_name(),
                    profile.continue_watching.len()
                );
            }
        }
        ProfileCommand::Create {
            name,
            pronoun,
            color,
            character,
            password,
        } => {
            let password = password.then(prompt_new_password).transpose()?;
            let profile = profiles.create_profile(NewProfile {
                name,
                pronoun,
                avatar: Avatar {
                    background: color.map(Background::Color).unwrap_or_default(),
                    character,
                    frame: None,
                },
                password,
            })?;
            println!("Created profile {} ({}).", profile.display_name(), profile.id);
            if profiles.active_profile_id().is_none()
                && Confirm::with_theme(&theme())
                    .with_prompt("Switch to it now?")
                    .default(true)
                    .interact()?
            {
                profiles.set_active_profile(&profile.id)?;
            }
        }
        ProfileCommand::Select { id } => {
            let profile = match id {
                Some(id) => {
                    let profile = profiles
                        .get_profile(&id)
                        .ok_or_else(|| anyhow!("No profile with id {id}"))?;
                    let attempt = if profile.is_locked() {
                        Some(
                            Password::with_theme(&theme())
                                .with_prompt(format!("Password for {}", profile.name))
                                .interact()?,
                        )
                    } else {
                        None
                    };
                    Some(profiles.activate_with_password(&id, attempt.as_deref())?)
                }
                None => choose_profile(profiles, &profiles.list_profiles())?,
            };
            if let Some(profile) = profile {
                println!("Watching as {}.", profile.display_name());
            }
        }
        ProfileCommand::Edit {
            id,
            name,
            pronoun,
            color,
            password,
            clear_password,
        } => {
            let existing = profiles
                .get_profile(&id)
                .ok_or_else(|| anyhow!("No profile with id {id}"))?;
            let password = if clear_password {
                Some(None)
            } else if password {
                Some(Some(prompt_new_password()?))
            } else {
                None
            };
            let avatar = color.map(|color| Avatar {
                background: Background::Color(color),
                ..existing.avatar
            });
            let updated = profiles
                .update_profile(
                    &id,
                    ProfilePatch {
                        name,
                        pronoun,
                        avatar,
                        password,
                    },
                )?
                .ok_or_else(|| anyhow!("No profile with id {id}"))?;
            println!("Updated {}.", updated.display_name());
        }
        ProfileCommand::Delete { id } => {
            if !profiles.delete_profile(&id)? {
                bail!("No profile with id {id}");
            }
            println!("Deleted profile {id}.");
        }
        ProfileCommand::Logout => {
            profiles.clear_active_profile()?;
            println!("Continuing as guest.");
        }
    }
    Ok(())
}

fn prompt_new_password() -> Result<String> {
    Ok(Password::with_theme(&theme())
        .with_prompt("Password")
        .with_confirmation("Repeat password", "Passwords don't match")
        .interact()?)
}

async fn run_download(app: &App, action: DownloadCommand) -> Result<()> {
    match action {
        DownloadCommand::Episode {
            id,
            season,
            episode,
        } => {
            let catalog = app.catalog().await?;
            let anime = find_anime(&catalog, &id)?;
            let item = DownloadItem::episode(anime, season, episode.saturating_sub(1))
                .ok_or_else(|| anyhow!("{} has no season {season} episode {episode}", anime.title))?;
            let mut manager = app.downloads()?;
            report_outcome(&item, manager.download_item(&item).await);
        }
        DownloadCommand::Season { id, season } => {
            let catalog = app.catalog().await?;
            let anime = find_anime(&catalog, &id)?;
            let count = anime.season(season).map_or(0, |s| s.episodes.len());
            let items: Vec<DownloadItem> = (0..count)
                .filter_map(|idx| DownloadItem::episode(anime, season, idx))
                .collect();
            if items.is_empty() {
                bail!("{} season {season} has nothing to download", anime.title);
            }
            run_bulk(app, &items).await?;
        }
        DownloadCommand::Music { id, track } => {
            let catalog = app.catalog().await?;
            let anime = find_anime(&catalog, &id)?;
            let playlist = Playlist::new(anime.music.clone());
            let mut items = playlist.download_items();
            if let Some(track) = track {
                let idx = track.saturating_sub(1);
                if idx >= items.len() {
                    bail!("{} has no track {track}", anime.title);
                }
                items = vec![items.swap_remove(idx)];
            }
            if items.is_empty() {
                bail!("{} has no soundtrack", anime.title);
            }
            run_bulk(app, &items).await?;
        }
        DownloadCommand::List => {
            let manager = app.downloads()?;
            let records = manager.list_downloads();
            if records.is_empty() {
                println!("No downloads.");
            }
            for record in records {
                let state = if manager.is_cached(&record.item.url) {
                    "ready"
                } else {
                    "missing"
                };
                println!("{}  {}  [{state}]", record.item.key, record.item.title);
            }
            println!(
                "Offline cache: {:.1} MB",
                manager.cache().total_size() as f64 / (1024.0 * 1024.0)
            );
        }
        DownloadCommand::Remove { key } => {
            let mut manager = app.downloads()?;
            if !manager.remove_download(&key)? {
                bail!("No download with key {key}");
            }
            println!("Removed {key}.");
        }
        DownloadCommand::Clear => {
            let mut manager = app.downloads()?;
            let report = manager.clear_downloads()?;
            println!("Removed {} downloads.", report.removed);
            for url in report.eviction_failures {
                println!("Could not evict {url}");
            }
        }
        DownloadCommand::Repair => {
            let mut manager = app.downloads()?;
            let report = manager.repair()?;
            println!(
                "Dropped {} stale records, removed {} orphaned files.",
                report.dropped_records.len(),
                report.orphaned_blobs.len()
            );
        }
    }
    Ok(())
}

async fn run_bulk(app: &App, items: &[DownloadItem]) -> Result<()> {
    let mut manager = app.downloads()?;
    let report = manager
        .run_bulk(items, |status| eprintln!("\n[{status}]"))
        .await;
    println!(
        "{} downloaded, {} already offline, {} failed.",
        report.downloaded, report.skipped, report.failed
    );
    if report.failed > 0 {
        bail!("{} of {} downloads failed", report.failed, report.total);
    }
    Ok(())
}

fn report_outcome(item: &DownloadItem, outcome: DownloadOutcome) {
    eprintln!();
    match outcome {
        DownloadOutcome::AlreadyDownloaded => println!("{} is already offline.", item.title),
        DownloadOutcome::Downloaded => println!("Downloaded {}.", item.title),
        DownloadOutcome::Failed(reason) => println!("Download failed: {reason}"),
    }
}

async fn run_clip(app: &App, action: ClipCommand) -> Result<()> {
    let mut recorder = app.clip_recorder();
    match action {
        ClipCommand::Record {
            id,
            season,
            episode,
            at,
            length,
        } => {
            let catalog = app.catalog().await?;
            let anime = find_anime(&catalog, &id)?;
            let episode = episode.saturating_sub(1);
            let source = anime
                .episode(season, episode)
                .and_then(|ep| ep.primary_source())
                .map(|url| {
                    app.settings
                        .offline_cache()
                        .blob_url(&url)
                        .map(|u| u.to_string())
                        .unwrap_or(url)
                });
            let mut media = episode_now_playing(anime, season, episode, source);
            media.position = at
                .or_else(|| {
                    app.history
                        .position(&anime.id)
                        .filter(|p| p.season == season && p.episode == episode)
                        .map(|p| p.time)
                })
                .unwrap_or(0.0);

            recorder.start_recording(Some(&media), Utc::now())?;
            let length = length.min(MAX_CLIP_SECONDS as u64);
            println!(
                "Recording {} from {} for up to {length}s (Ctrl-C to stop)...",
                media.display_title(),
                format_clock(media.position)
            );
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_secs(length)) => {}
                _ = tokio::signal::ctrl_c() => println!("Stopping."),
            }
            let now = Utc::now();
            let mut clip = recorder.tick(now)?;
            if recorder.is_recording() {
                clip = recorder.stop_recording(now)?;
            }
            let Some(clip) = clip else {
                println!("Nothing was captured.");
                return Ok(());
            };
            let path = recorder.save_clip(&clip.id, &app.settings.clips_dir())?;
            println!("Saved {:.1}s clip to {}", clip.duration, path.display());
        }
        ClipCommand::List => {
            let clips = recorder.list_clips();
            if clips.is_empty() {
                println!("No clips.");
            }
            for clip in clips {
                let saved = app.settings.clips_dir().join(&clip.filename);
                let location = if saved.is_file() {
                    saved.display().to_string()
                } else {
                    String::from("not saved")
                };
                println!(
                    "{}  {} · {} ({:.1}s) {location}",
                    clip.id, clip.title, clip.subtitle, clip.duration
                );
            }
        }
        ClipCommand::Remove { id } => {
            if !recorder.remove_clip(&id)? {
                bail!("No clip with id {id}");
            }
            println!("Removed {id}.");
        }
        ClipCommand::Clear => {
            let count = recorder.clear_clips()?;
            println!("Removed {count} clips.");
        }
    }
    Ok(())
}

async fn serve(app: &App, port: Option<u16>) -> Result<()> {
    let mut options = app.settings.proxy_options()?;
    if let Some(port) = port {
        options.port = port;
    }
    if options.origin.is_none() {
        println!("No proxy.origin configured; only ?src= media requests will be served.");
    }
    let transport = HttpTransport::new().context("failed to build proxy client")?;
    let routes = MediaRoutes::new(
        options,
        app.settings.proxy_cache(),
        transport,
        tokio::runtime::Handle::current(),
    )
    .with_downloads(app.settings.offline_cache());
    let mut proxy = LocalMediaProxy::start(routes)?;
    println!("Serving on {} (Ctrl-C to stop)", proxy.base_url);
    tokio::signal::ctrl_c()
        .await
        .context("failed to wait for Ctrl-C")?;
    tokio::task::block_in_place(|| proxy.shutdown());
    Ok(())
}

fn format_clock(seconds: f64) -> String {
    let total = seconds.max(0.0) as u64;
    format!("{}:{:02}", total / 60, total % 60)
}

fn theme() -> ColorfulTheme {
    ColorfulTheme::default()
}
