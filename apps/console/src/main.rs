use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use client_core::{
    load_settings, ConnectionState, DiscussionFilter, RealtimeClient, TransportKind, Viewer,
};
use shared::{
    domain::{DiscussionId, DiscussionStatus, UserId},
    protocol::ServerEvent,
};
use tokio_stream::{wrappers::BroadcastStream, StreamExt};
use tracing::{info, warn};

#[derive(Parser, Debug)]
struct Args {
    /// Overrides API_BASE_URL / client.toml.
    #[arg(long)]
    base_url: Option<String>,
    #[arg(long)]
    token: Option<String>,
    /// Restrict the socket to one transport.
    #[arg(long, value_enum)]
    transport: Option<TransportArg>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum TransportArg {
    Websocket,
    Polling,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum StatusArg {
    Open,
    Locked,
    Archived,
}

impl From<StatusArg> for DiscussionStatus {
    fn from(value: StatusArg) -> Self {
        match value {
            StatusArg::Open => DiscussionStatus::Open,
            StatusArg::Locked => DiscussionStatus::Locked,
            StatusArg::Archived => DiscussionStatus::Archived,
        }
    }
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Connect, join channels and print pushed events until Ctrl-C.
    Listen {
        #[arg(long)]
        user_id: String,
        #[arg(long, default_value = "Console")]
        name: String,
        #[arg(long = "discussion")]
        discussions: Vec<String>,
    },
    ListDiscussions {
        #[arg(long, default_value_t = 1)]
        page: u32,
        #[arg(long, value_enum)]
        status: Option<StatusArg>,
    },
    Stats,
    TogglePin {
        discussion_id: String,
    },
    ToggleLock {
        discussion_id: String,
    },
    DeleteDiscussion {
        discussion_id: String,
    },
    SiteSettings,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();
    let args = Args::parse();

    let mut settings = load_settings();
    if let Some(base_url) = args.base_url {
        settings.base_url = base_url.trim_end_matches('/').to_string();
    }
    if args.token.is_some() {
        settings.auth_token = args.token;
    }
    if let Some(transport) = args.transport {
        settings.transports = vec![match transport {
            TransportArg::Websocket => TransportKind::WebSocket,
            TransportArg::Polling => TransportKind::Polling,
        }];
    }
    let client = RealtimeClient::new(settings).context("failed to build client")?;

    match args.command {
        Command::Listen {
            user_id,
            name,
            discussions,
        } => listen(&client, user_id, name, discussions).await?,
        Command::ListDiscussions { page, status } => {
            let filter = DiscussionFilter {
                page,
                status: status.map(Into::into),
            };
            let listing = client.admin_forum().list_discussions(filter).await?;
            println!("page {}/{} ({} total)", listing.page, listing.total_pages, listing.total);
            for item in &listing.items {
                println!(
                    "{}\t{}\t{}{}\t{} posts",
                    item.discussion_id,
                    item.status.as_str(),
                    if item.is_pinned { "pinned " } else { "" },
                    item.title,
                    item.post_count
                );
            }
        }
        Command::Stats => {
            let stats = client.admin_forum().forum_stats().await?;
            println!("{}", serde_json::to_string_pretty(&*stats)?);
        }
        Command::TogglePin { discussion_id } => {
            let updated = client
                .admin_forum()
                .toggle_pin(&DiscussionId::new(discussion_id))
                .await
                .map_err(|err| err.into_inner())?;
            println!("{} pinned={}", updated.discussion_id, updated.is_pinned);
        }
        Command::ToggleLock { discussion_id } => {
            let updated = client
                .admin_forum()
                .toggle_lock(&DiscussionId::new(discussion_id))
                .await
                .map_err(|err| err.into_inner())?;
            println!("{} status={}", updated.discussion_id, updated.status.as_str());
        }
        Command::DeleteDiscussion { discussion_id } => {
            let id = DiscussionId::new(discussion_id);
            client
                .admin_forum()
                .delete_discussion(&id)
                .await
                .map_err(|err| err.into_inner())?;
            println!("deleted {id}");
        }
        Command::SiteSettings => {
            let site = client.site_settings().get().await?;
            println!("{}", serde_json::to_string_pretty(&*site)?);
        }
    }

    Ok(())
}

async fn listen(
    client: &RealtimeClient,
    user_id: String,
    name: String,
    discussions: Vec<String>,
) -> Result<()> {
    let user_id = UserId::new(user_id);
    let notifications = client.notifications(user_id.clone());
    let _feeds: Vec<_> = discussions
        .into_iter()
        .map(|id| {
            client.open_discussion(
                DiscussionId::new(id),
                Viewer {
                    user_id: user_id.clone(),
                    name: name.clone(),
                },
            )
        })
        .collect();

    let mut events = BroadcastStream::new(client.dispatcher().stream());
    let mut state = client.connect();
    info!(rooms = client.rooms().joined_rooms().len(), "listening; press Ctrl-C to stop");

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            changed = state.changed() => {
                if changed.is_err() {
                    break;
                }
                let current = *state.borrow_and_update();
                println!("connection: {current:?}");
                if current == ConnectionState::Failed {
                    warn!(
                        attempts = client.connection().reconnect_attempts(),
                        "gave up reconnecting"
                    );
                    break;
                }
            }
            event = events.next() => match event {
                Some(Ok(event)) => print_event(&event, notifications.unread_count()),
                Some(Err(err)) => warn!(%err, "event stream lagged"),
                None => break,
            },
        }
    }

    client.disconnect().await;
    Ok(())
}

fn print_event(event: &ServerEvent, unread: u64) {
    match event {
        ServerEvent::PostNew(post) => {
            println!("[{}] {} posted: {}", post.discussion_id, post.author.name, post.content)
        }
        ServerEvent::PostUpdated {
            discussion_id,
            likes,
            ..
        } => println!("[{discussion_id}] likes now {likes}"),
        ServerEvent::CommentNew(comment) => println!(
            "[{}] {} commented on {}: {}",
            comment.discussion_id, comment.author.name, comment.post_id, comment.content
        ),
        ServerEvent::CommentUpdated { comment_id, likes } => {
            println!("comment {comment_id} likes now {likes}")
        }
        ServerEvent::NotificationNew(notification) => println!(
            "notification ({unread} unread): {} - {}",
            notification.title, notification.message
        ),
        ServerEvent::TypingIndicator { user_name, .. } => println!("{user_name} is typing..."),
        ServerEvent::StopTypingIndicator { user_id, .. } => println!("{user_id} stopped typing"),
    }
}
