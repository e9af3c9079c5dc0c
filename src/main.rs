mod cli;

use anyhow::{Context, Result, bail};
use camgrid::archive::{ArchiveSource, LocalArchive};
use camgrid::credentials::{CredentialCipher, UrlCredentialCodec, decode_for_display};
use camgrid::layout::compute_layout;
use camgrid::prefs::SharedPreferences;
use camgrid::session::PlaybackMode;
use camgrid::store::{self, StreamConfig, StreamStore, TransportMode};
use camgrid::viewer::{GridOptions, run_grid};
use clap::Parser;
use cli::{ArchiveCommand, Cli, Command, GroupsCommand, StreamsCommand};
use std::fs::OpenOptions;
use std::sync::Mutex;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let interactive = matches!(cli.command, Command::View(_) | Command::Group(_));
    init_logging(interactive)?;

    match cli.command {
        Command::Streams(args) => match args.command {
            StreamsCommand::List(list_args) => list_streams(&store::load_store()?, list_args.json)?,
            StreamsCommand::Add(add) => {
                let codec = installation_codec();
                let mut store = store::load_store()?;
                let stream = StreamConfig {
                    name: add.name.clone(),
                    primary_url: codec.encode_edited_url(&add.url, None),
                    secondary_url: add.channel.map(|url| codec.encode_edited_url(&url, None)),
                    transport: if add.udp {
                        TransportMode::Udp
                    } else {
                        TransportMode::Tcp
                    },
                    archive_url: add.archive.map(|url| codec.encode_edited_url(&url, None)),
                };
                let index = store
                    .add_stream(stream)
                    .with_context(|| format!("can't add stream '{}'", add.name))?;
                store::save_store(&store).context("failed to save stream store")?;
                println!("Added stream #{}: {}", index + 1, add.name);
            }
            StreamsCommand::Edit(edit) => {
                let codec = installation_codec();
                let mut store = store::load_store()?;
                let Some((index, previous)) = store.find_stream(&edit.name) else {
                    bail!("stream '{}' not found", edit.name);
                };
                let mut updated = previous.clone();
                if let Some(name) = edit.rename {
                    updated.name = name;
                }
                if let Some(url) = edit.url {
                    updated.primary_url = codec.encode_edited_url(&url, Some(&previous.primary_url));
                }
                if edit.clear_channel {
                    updated.secondary_url = None;
                } else if let Some(url) = edit.channel {
                    updated.secondary_url = Some(
                        codec.encode_edited_url(&url, previous.secondary_url.as_deref()),
                    );
                }
                if let Some(transport) = edit.transport {
                    updated.transport = transport.into();
                }
                if let Some(url) = edit.archive {
                    updated.archive_url =
                        Some(codec.encode_edited_url(&url, previous.archive_url.as_deref()));
                }

                store
                    .update_stream(index, updated)
                    .with_context(|| format!("can't update stream '{}'", edit.name))?;
                store::save_store(&store).context("failed to save stream store")?;
                println!("Updated stream: {}", edit.name);
            }
            StreamsCommand::Remove(remove) => {
                let mut store = store::load_store()?;
                let Some((index, _)) = store.find_stream(&remove.name) else {
                    bail!("stream '{}' not found", remove.name);
                };
                store.remove_stream(index);
                store::save_store(&store).context("failed to save stream store")?;
                println!("Removed stream: {}", remove.name);
            }
        },
        Command::Groups(args) => match args.command {
            GroupsCommand::List => list_groups(&store::load_store()?),
            GroupsCommand::Add(add) => {
                let mut store = store::load_store()?;
                let group = store.group_from_names(&add.name, &add.streams)?;
                store.add_group(group)?;
                store::save_store(&store).context("failed to save stream store")?;
                println!("Added group: {}", add.name);
            }
            GroupsCommand::Remove(remove) => {
                let mut store = store::load_store()?;
                if !store.remove_group(&remove.name) {
                    bail!("group '{}' not found", remove.name);
                }
                store::save_store(&store).context("failed to save stream store")?;
                println!("Removed group: {}", remove.name);
            }
        },
        Command::View(args) => {
            let store = store::load_store()?;
            let streams = args
                .streams
                .iter()
                .map(|name| {
                    store
                        .find_stream(name)
                        .map(|(_, stream)| stream.clone())
                        .with_context(|| format!("stream '{name}' not found"))
                })
                .collect::<Result<Vec<_>>>()?;
            let options = GridOptions {
                title: args.streams.join(", "),
                refresh_fps: args.refresh_fps,
                start: PlaybackMode::Live,
            };
            view(streams, &store, &options).await?;
        }
        Command::Group(args) => {
            let store = store::load_store()?;
            let streams = store
                .resolve_group(&args.name)?
                .into_iter()
                .cloned()
                .collect::<Vec<_>>();
            let options = GridOptions {
                title: args.name,
                refresh_fps: args.refresh_fps,
                start: PlaybackMode::Live,
            };
            view(streams, &store, &options).await?;
        }
        Command::Layout(args) => {
            let layout = compute_layout(args.width, args.height, args.count, args.aspect);
            println!(
                "grid {}x{}  cell {}x{}  letterbox {:?}",
                layout.columns, layout.rows, layout.cell_width, layout.cell_height, layout.letterbox
            );
            for (idx, cell) in layout.cells.iter().enumerate() {
                println!(
                    "{:<4} x={:<6} y={:<6} {}x{}",
                    idx + 1,
                    cell.x,
                    cell.y,
                    cell.width,
                    cell.height
                );
            }
        }
        Command::Archive(args) => match args.command {
            ArchiveCommand::List(list) => {
                let store = store::load_store()?;
                let (_, archive) = stream_archive(&store, &list.stream)?;
                let entries = archive.list(&list.dir)?;
                if entries.is_empty() {
                    println!("No recordings in '{}'.", list.dir);
                }
                for entry in entries {
                    let kind = if entry.is_dir { "dir" } else { "file" };
                    println!("{kind:<5} {:>12}  {}", entry.size, entry.name);
                }
            }
            ArchiveCommand::Play(play) => {
                let store = store::load_store()?;
                let (stream, archive) = stream_archive(&store, &play.stream)?;
                archive
                    .fetch(&play.path)
                    .with_context(|| format!("can't open recording '{}'", play.path))?;
                let options = GridOptions {
                    title: format!("{} {}", play.stream, play.path),
                    refresh_fps: play.refresh_fps,
                    start: PlaybackMode::Archive {
                        remote_path: play.path,
                    },
                };
                view(vec![stream], &store, &options).await?;
            }
        },
    }

    Ok(())
}

async fn view(streams: Vec<StreamConfig>, store: &StreamStore, options: &GridOptions) -> Result<()> {
    if streams.is_empty() {
        bail!("nothing to show");
    }
    let codec = installation_codec();
    let prefs = SharedPreferences::new(store.preferences);
    run_grid(streams, &codec, prefs, options).await
}

fn stream_archive(store: &StreamStore, name: &str) -> Result<(StreamConfig, LocalArchive)> {
    let Some((_, stream)) = store.find_stream(name) else {
        bail!("stream '{name}' not found");
    };
    let Some(archive_url) = &stream.archive_url else {
        bail!("stream '{name}' has no archive");
    };
    let codec = installation_codec();
    let archive = LocalArchive::from_url(&codec.decode_for_connection(archive_url))?;
    Ok((stream.clone(), archive))
}

fn installation_codec() -> UrlCredentialCodec {
    let secret = store::installation_secret();
    UrlCredentialCodec::new(CredentialCipher::for_installation(secret.as_deref()))
}

fn list_streams(store: &StreamStore, json: bool) -> Result<()> {
    if json {
        let masked = store
            .streams
            .iter()
            .map(|stream| StreamConfig {
                primary_url: decode_for_display(&stream.primary_url),
                secondary_url: stream.secondary_url.as_deref().map(decode_for_display),
                archive_url: stream.archive_url.as_deref().map(decode_for_display),
                ..stream.clone()
            })
            .collect::<Vec<_>>();
        println!("{}", serde_json::to_string_pretty(&masked)?);
        return Ok(());
    }

    if store.streams.is_empty() {
        println!("No streams configured. Run `camgrid streams add` first.");
        return Ok(());
    }

    println!(
        "{:<6}  {:<20}  {:<9}  {:<7}  URL",
        "INDEX", "NAME", "TRANSPORT", "CHANNEL"
    );
    for (idx, stream) in store.streams.iter().enumerate() {
        println!(
            "{:<6}  {:<20}  {:<9}  {:<7}  {}",
            idx + 1,
            stream.name,
            format!("{:?}", stream.transport).to_lowercase(),
            if stream.secondary_url.is_some() { "2" } else { "1" },
            decode_for_display(&stream.primary_url)
        );
    }
    Ok(())
}

fn list_groups(store: &StreamStore) {
    if store.groups.is_empty() {
        println!("No groups configured. Run `camgrid groups add` first.");
        return;
    }
    for group in &store.groups {
        match store.resolve_group(&group.name) {
            Ok(streams) => {
                let names = streams
                    .iter()
                    .map(|stream| stream.name.as_str())
                    .collect::<Vec<_>>();
                println!("{:<20}  {}", group.name, names.join(", "));
            }
            Err(err) => println!(
                "{:<20}  unusable: {err} (run `camgrid groups remove {}`)",
                group.name, group.name
            ),
        }
    }
}

fn init_logging(to_file: bool) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("camgrid=info"));

    if to_file {
        // The grid owns the terminal, so logs go to a file while it runs.
        let path = store::log_path()?;
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("failed opening log file {}", path.display()))?;
        tracing_subscriber::registry()
            .with(filter)
            .with(
                tracing_subscriber::fmt::layer()
                    .with_ansi(false)
                    .with_writer(Mutex::new(file)),
            )
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
    }
    Ok(())
}
