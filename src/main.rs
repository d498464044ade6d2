use std::io::BufRead;
use std::path::PathBuf;
use std::thread;

use log::{debug, error, info, warn};
use tokio::sync::broadcast;

use tunefetch::catalog::client::LookupKind;
use tunefetch::config_persistence::{default_config_path, load_config};
use tunefetch::orchestrator::Orchestrator;
use tunefetch::protocol::{JobId, Message, SearchCategory, Severity};

const BUS_CAPACITY: usize = 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Command {
    Search(String),
    Category(SearchCategory, String),
    More,
    Lookup(LookupKind, String),
    Fetch(String),
    Artist(String),
    Lyrics(String),
    Storefront(String),
    Cancel(JobId),
    CancelAll,
    Quit,
}

fn split_head(line: &str) -> (&str, &str) {
    let trimmed = line.trim();
    match trimmed.split_once(char::is_whitespace) {
        Some((head, rest)) => (head, rest.trim()),
        None => (trimmed, ""),
    }
}

fn required(rest: &str, usage: &str) -> Result<String, String> {
    if rest.is_empty() {
        Err(format!("usage: {usage}"))
    } else {
        Ok(rest.to_string())
    }
}

fn parse_command(line: &str) -> Result<Command, String> {
    let (head, rest) = split_head(line);
    match head.to_ascii_lowercase().as_str() {
        "search" => required(rest, "search <term>").map(Command::Search),
        "category" => {
            let (label, term) = split_head(rest);
            let category = SearchCategory::from_label(label)
                .ok_or_else(|| format!("unknown category '{label}'"))?;
            required(term, "category <albums|videos|playlists|artwork|...> <term>")
                .map(|term| Command::Category(category, term))
        }
        "more" => Ok(Command::More),
        "album" => required(rest, "album <id>").map(|id| Command::Lookup(LookupKind::Album, id)),
        "playlist" => {
            required(rest, "playlist <id>").map(|id| Command::Lookup(LookupKind::Playlist, id))
        }
        "fetch" => required(rest, "fetch <url>").map(Command::Fetch),
        "artist" => required(rest, "artist <url>").map(Command::Artist),
        "lyrics" => required(rest, "lyrics <song id>").map(Command::Lyrics),
        "storefront" => required(rest, "storefront <code>").map(Command::Storefront),
        "cancel" => rest
            .parse::<JobId>()
            .map(Command::Cancel)
            .map_err(|_| "usage: cancel <job id>".to_string()),
        "cancel-all" => Ok(Command::CancelAll),
        "quit" | "exit" => Ok(Command::Quit),
        "" => Err("empty command".to_string()),
        other => Err(format!("unknown command '{other}'")),
    }
}

/// Last category search, remembered so `more` can request the next page.
struct PageCursor {
    category: SearchCategory,
    term: String,
    next_offset: u32,
}

fn log_message(message: &Message) {
    match message {
        Message::Status { text, severity } => match severity {
            Severity::Info => info!("{}", text),
            Severity::Warning => warn!("{}", text),
            Severity::Error => error!("{}", text),
        },
        Message::JobProgress {
            job_id,
            current,
            total,
        } => debug!("job {}: {}/{}", job_id, current, total),
        Message::JobCompleted {
            job_id,
            payload,
            source_url,
        } => info!("job {} completed ({}): {}", job_id, source_url, payload),
        Message::JobFailed {
            job_id,
            source_url,
            message,
        } => warn!("job {} failed ({}): {}", job_id, source_url, message),
        Message::SearchResults {
            job_id,
            term,
            results,
        } => {
            for (category, items) in results {
                info!(
                    "job {}: '{}' {} -> {} result(s)",
                    job_id,
                    term,
                    category.label(),
                    items.len()
                );
            }
        }
        Message::CategoryResults {
            job_id,
            category,
            term,
            items,
            has_more,
        } => info!(
            "job {}: '{}' {} -> {} result(s), more={}",
            job_id,
            term,
            category.label(),
            items.len(),
            has_more
        ),
        Message::AppendResults {
            job_id,
            category,
            term,
            offset,
            items,
            has_more,
        } => info!(
            "job {}: '{}' {} @{} -> {} more result(s), more={}",
            job_id,
            term,
            category.label(),
            offset,
            items.len(),
            has_more
        ),
        Message::LookupResult {
            job_id,
            source,
            payload,
        } => info!("job {} lookup {}: {}", job_id, source, payload),
        Message::LyricsReady {
            job_id,
            song_id,
            lyrics,
        } => info!("job {} lyrics for {}:\n{}", job_id, song_id, lyrics),
        Message::TokenUnavailable { kind, detail } => {
            error!("credential unavailable ({:?}): {}", kind, detail)
        }
        Message::JobsCleared => info!("all jobs cleared"),
    }
}

fn run_command(
    orchestrator: &Orchestrator,
    command: Command,
    cursor: &mut Option<PageCursor>,
) -> Result<(), String> {
    let search_limit = orchestrator.config().catalog.search_limit;
    let submitted = match command {
        Command::Search(term) => orchestrator.search(&term),
        Command::Category(category, term) => {
            let submitted = orchestrator.search_category(category, &term, 0);
            *cursor = Some(PageCursor {
                category,
                term,
                next_offset: search_limit,
            });
            submitted
        }
        Command::More => {
            let Some(page) = cursor.as_mut() else {
                return Err("no category search to continue".to_string());
            };
            let submitted = orchestrator.search_category(page.category, &page.term, page.next_offset);
            page.next_offset = page.next_offset.saturating_add(search_limit);
            submitted
        }
        Command::Lookup(kind, id) => orchestrator.lookup_album(kind, &id),
        Command::Fetch(url) => orchestrator.fetch(&url),
        Command::Artist(url) => orchestrator.resolve_artist(&url),
        Command::Lyrics(song_id) => orchestrator.fetch_lyrics(&song_id),
        Command::Storefront(storefront) => {
            orchestrator.set_storefront(&storefront);
            return Ok(());
        }
        Command::Cancel(job_id) => {
            if !orchestrator.cancel(job_id) {
                warn!("job {} is not running", job_id);
            }
            return Ok(());
        }
        Command::CancelAll => {
            orchestrator.cancel_all();
            return Ok(());
        }
        Command::Quit => return Ok(()),
    };
    match submitted {
        Ok(job_id) => {
            info!("submitted job {}", job_id);
            Ok(())
        }
        Err(error) => Err(error.to_string()),
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let mut clog = colog::default_builder();
    clog.filter(None, log::LevelFilter::Debug);
    clog.init();

    std::panic::set_hook(Box::new(|panic_info| {
        let current_thread = std::thread::current();
        let thread_name = current_thread.name().unwrap_or("unnamed");
        log::error!("panic in thread '{}': {}", thread_name, panic_info);
    }));

    let config_path = std::env::args_os()
        .nth(1)
        .map(PathBuf::from)
        .or_else(default_config_path)
        .ok_or("no config directory available; pass a config path")?;
    let config = load_config(&config_path);
    info!("Loaded config from {}", config_path.display());

    // Bus for communication between components
    let (bus_sender, _) = broadcast::channel(BUS_CAPACITY);
    let mut bus_receiver = bus_sender.subscribe();
    let listener = thread::Builder::new()
        .name("bus-listener".to_string())
        .spawn(move || loop {
            match bus_receiver.blocking_recv() {
                Ok(message) => log_message(&message),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!("Bus listener lagged, skipped {} message(s)", skipped);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        })?;

    let orchestrator = Orchestrator::new(config, bus_sender);
    let mut cursor = None;
    let stdin = std::io::stdin();
    for line in stdin.lock().lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        match parse_command(&line) {
            Ok(Command::Quit) => break,
            Ok(command) => {
                if let Err(message) = run_command(&orchestrator, command, &mut cursor) {
                    warn!("{}", message);
                }
            }
            Err(message) => warn!("{}", message),
        }
    }

    orchestrator.shutdown();
    drop(orchestrator);
    if listener.join().is_err() {
        warn!("Bus listener exited with a panic");
    }
    Ok(())
}
