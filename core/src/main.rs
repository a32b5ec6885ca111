use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use time::format_description::well_known::Rfc3339;
use tokio::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use chat_api::{Dimension, Message};
use chatcore::{
    audio::{
        fetch_with_progress,
        mock::{MockBackend, MockMicrophone},
        IntervalClock,
    },
    cli::{Cli, Command, ResolveArgs},
    config::Config,
    recipients::{FilterEditor, RecipientCount, RecipientResolver},
    ConversationTransport, Devices, HttpTransport, SyncEngine, SyncEvent, ViewSession,
};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let cfg = Config::load(&cli.config)?;
    let level = if cfg.logging_enabled { "info" } else { "warn" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level)),
        )
        .init();

    let transport: Arc<dyn ConversationTransport> = Arc::new(
        HttpTransport::new(&cfg.server_url, cfg.token.clone())
            .with_context(|| format!("cannot use server url {}", cfg.server_url))?,
    );

    match cli.command {
        Command::Conversations => {
            for c in transport.list_conversations().await? {
                let name = c.name.clone().unwrap_or_else(|| {
                    c.participants
                        .iter()
                        .map(|p| p.display_name())
                        .collect::<Vec<_>>()
                        .join(", ")
                });
                let kind = if c.is_broadcast { "broadcast" } else { "" };
                println!("{:<16} {:>4} {:<10} {}", c.id, c.unread_count, kind, name);
            }
        }
        Command::Messages { conversation } => {
            for m in transport.list_messages(&conversation).await? {
                print_message(&m);
            }
        }
        Command::Send { conversation, text } => {
            let engine = SyncEngine::new(transport, cfg.user.clone(), cfg.sync);
            engine.set_active_conversation(Some(conversation)).await;
            let sent = engine.send(&text).await?;
            print_message(&sent);
            engine.shutdown();
        }
        Command::Watch { conversation } => {
            let session = ViewSession::open(
                transport,
                cfg.user.clone(),
                headless_devices(),
                cfg.session_settings(),
            );
            let engine = session.engine().clone();
            let mut events = engine.subscribe();
            if conversation.is_some() {
                session.set_active_conversation(conversation).await;
            }
            info!("watching - press Ctrl+C to exit");
            loop {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => break,
                    event = events.recv() => match event {
                        Some(event) => report(&engine, event),
                        None => break,
                    },
                }
            }
            session.close();
        }
        Command::Resolve(args) => {
            let count = resolve(transport, &args).await?;
            match count {
                RecipientCount::Known(n) => println!("{n} recipients"),
                RecipientCount::Unknown => println!("unknown (select a recipient class)"),
            }
        }
        Command::FetchAudio { url, duration, out } => {
            let mut shown = 0u32;
            let bytes = fetch_with_progress(
                transport.as_ref(),
                &url,
                duration,
                cfg.player.assumed_bytes_per_sec,
                &CancellationToken::new(),
                |fraction| {
                    let percent = (fraction * 100.0) as u32;
                    if percent >= shown + 10 || percent == 100 {
                        shown = percent;
                        eprintln!("{percent:>3}%");
                    }
                },
            )
            .await?;
            tokio::fs::write(&out, &bytes)
                .await
                .with_context(|| format!("cannot write {}", out.display()))?;
            info!(bytes = bytes.len(), path = %out.display(), "audio saved");
        }
    }
    Ok(())
}

async fn resolve(
    transport: Arc<dyn ConversationTransport>,
    args: &ResolveArgs,
) -> Result<RecipientCount> {
    let resolver = RecipientResolver::with_debounce(transport, Duration::ZERO);
    let mut editor = FilterEditor::new(resolver.load_options().await?);
    editor.set_recipient_class(args.class.map(Into::into));
    let selections = [
        (Dimension::Region, &args.region),
        (Dimension::City, &args.city),
        (Dimension::Grade, &args.grade),
        (Dimension::School, &args.school),
        (Dimension::Branch, &args.branch),
        (Dimension::Language, &args.language),
        (Dimension::Schedule, &args.schedule),
    ];
    for (dim, ids) in selections {
        for id in ids {
            if !editor.filter().is_selected(dim, id) {
                editor.toggle(dim, id);
            }
        }
    }
    let mut status = resolver.subscribe();
    resolver.request(editor.filter().clone());
    status
        .wait_for(|s| !s.is_resolving())
        .await
        .context("resolver stopped")?;
    let count = resolver.status().count;
    resolver.close();
    Ok(count)
}

/// The CLI never records or plays audio.
fn headless_devices() -> Devices {
    Devices {
        backend: Arc::new(MockBackend::new(0.0)),
        clock: Arc::new(IntervalClock::default()),
        microphone: Arc::new(MockMicrophone::new(1024, Duration::from_millis(100))),
    }
}

fn report(engine: &SyncEngine, event: SyncEvent) {
    match event {
        SyncEvent::ConversationsReplaced => {
            let unread: u32 = engine.conversations().iter().map(|c| c.unread_count).sum();
            info!(
                conversations = engine.conversations().len(),
                unread, "conversation list updated"
            );
        }
        SyncEvent::MessagesReplaced { conversation_id } => {
            info!(conversation = %conversation_id, messages = engine.messages().len(), "messages updated");
        }
        SyncEvent::MessageInserted { id } | SyncEvent::MessageEdited { id } => {
            if let Some(m) = engine.message(&id) {
                print_message(&m);
            }
        }
        SyncEvent::SendFailed { provisional_id, reason } => {
            warn!(id = %provisional_id, %reason, "send failed");
        }
        SyncEvent::DeleteFailed { id, reason } => {
            warn!(%id, %reason, "delete failed");
        }
        other => info!(event = ?other, "sync event"),
    }
}

fn print_message(m: &Message) {
    let when = time::OffsetDateTime::from_unix_timestamp(m.created_at)
        .ok()
        .and_then(|t| t.format(&Rfc3339).ok())
        .unwrap_or_else(|| m.created_at.to_string());
    let body = match &m.audio {
        Some(a) => format!("[voice {}s] {}", a.duration_secs, a.url),
        None => m.text.clone(),
    };
    let edited = if m.edited { " (edited)" } else { "" };
    println!("{when} {:<12} {}: {body}{edited}", m.id, m.sender_name);
}
