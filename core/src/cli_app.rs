use crate::backend::{Backend, LocalBackend, SupabaseBackend};
use crate::client::ChatClient;
use crate::config::{clear_backend_config, load_backend_config, save_backend_config, BackendConfig, BackendKind, Config};
use crate::conversation_store::{DeliveryStatus, TimelineEntry};
use crate::messenger_types::MessengerEvent;
use crate::notifications::{summarize_content, TerminalNotifier};
use colored::*;
use std::io::Write;
use std::path::Path;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader, Lines, Stdin};

type Input = Lines<BufReader<Stdin>>;

enum Exit {
    Quit,
    /// Backend details changed or were removed; back to the setup screen
    Reconnect,
}

/// Interactive terminal front end
pub async fn run(mut config: Config) -> anyhow::Result<()> {
    print_banner();
    let mut input = BufReader::new(tokio::io::stdin()).lines();

    loop {
        let Some(backend) = connect(&mut config, &mut input).await? else {
            return Ok(());
        };
        let client = ChatClient::new(backend, config.clone(), Arc::new(TerminalNotifier::new()));
        match session_loop(&client, &config, &mut input).await? {
            Exit::Quit => return Ok(()),
            Exit::Reconnect => continue,
        }
    }
}

/// Open the configured backend, showing the setup screen until the hosted
/// backend has connection details. `None` means the user quit.
async fn connect(config: &mut Config, input: &mut Input) -> anyhow::Result<Option<Arc<dyn Backend>>> {
    loop {
        if config.backend == BackendKind::Local {
            let backend = LocalBackend::open(&config.data_dir)?;
            println!(
                "{} Using local store in {}",
                "✓".green(),
                config.data_dir.display().to_string().cyan()
            );
            return Ok(Some(Arc::new(backend)));
        }

        match load_backend_config(&config.data_dir) {
            Ok(Some(details)) => {
                println!("{} Backend: {}", "✓".green(), details.url.cyan());
                let backend = SupabaseBackend::new(&*config, details)?;
                return Ok(Some(Arc::new(backend)));
            }
            Ok(None) => {}
            Err(e) => eprintln!("{} {}", "✗".red().bold(), e.to_string().red()),
        }

        print_setup_screen();
        let Some(line) = prompt(input, "setup").await? else {
            return Ok(None);
        };
        let parts: Vec<&str> = line.split_whitespace().collect();
        match parts.as_slice() {
            ["setup", url, key] => match BackendConfig::new(url, key) {
                Ok(details) => save_backend_config(&config.data_dir, &details)?,
                Err(e) => eprintln!("{} {}", "✗".red().bold(), e.to_string().red()),
            },
            ["local"] => config.backend = BackendKind::Local,
            ["quit"] | ["exit"] => return Ok(None),
            [] => {}
            _ => eprintln!("{}", "Usage: setup <url> <anon-key>".yellow()),
        }
    }
}

async fn session_loop(client: &ChatClient, config: &Config, input: &mut Input) -> anyhow::Result<Exit> {
    let auth_watch = client.watch_auth_state();
    let printer = spawn_event_printer(client);

    match client.restore_session().await {
        Ok(Some(me)) => println!("{} Welcome back, {}", "✓".green(), me.username.cyan().bold()),
        Ok(None) => println!("{}", "Sign in with `login <email> <password>` or create an account with `signup`.".dimmed()),
        Err(e) => eprintln!("{} {}", "✗".red().bold(), e.to_string().red()),
    }

    let exit = loop {
        let label = match client.open_peer().await {
            Some(peer) => peer.username,
            None => "whatschat".to_string(),
        };
        let Some(line) = prompt(input, &label).await? else {
            break Exit::Quit;
        };
        match handle_command(client, config, line.trim()).await {
            Ok(Some(exit)) => break exit,
            Ok(None) => {}
            Err(e) if e.is_fatal() => return Err(e.into()),
            Err(e) => eprintln!("{} {}", "✗".red().bold(), e.to_string().red()),
        }
    };

    client.stop_listener().await;
    auth_watch.abort();
    printer.abort();
    Ok(exit)
}

async fn handle_command(client: &ChatClient, config: &Config, line: &str) -> crate::Result<Option<Exit>> {
    if line.is_empty() {
        return Ok(None);
    }
    let (command, rest) = line.split_once(' ').unwrap_or((line, ""));
    let rest = rest.trim();
    let args: Vec<&str> = rest.split_whitespace().collect();

    match command {
        "help" => print_help(),
        "quit" | "exit" => return Ok(Some(Exit::Quit)),
        "setup" | "disconnect" if config.backend == BackendKind::Local => {
            eprintln!("{}", "The local store has no backend details to change".yellow());
        }
        "setup" => match args.as_slice() {
            [url, key] => {
                let details = BackendConfig::new(url, key)?;
                save_backend_config(&config.data_dir, &details)?;
                client.sign_out().await?;
                println!("{} Saved backend {}", "✓".green(), details.url.cyan());
                return Ok(Some(Exit::Reconnect));
            }
            _ => eprintln!("{}", "Usage: setup <url> <anon-key>".yellow()),
        },
        "disconnect" => {
            client.sign_out().await?;
            clear_backend_config(&config.data_dir)?;
            println!("{} Backend details removed", "✓".green());
            return Ok(Some(Exit::Reconnect));
        }
        "signup" => match args.as_slice() {
            [email, password, ..] => {
                let username = args.get(2).copied();
                let user = client.sign_up(email, password, username).await?;
                println!(
                    "{} Account created for {}. Now `login`.",
                    "✓".green().bold(),
                    user.email.cyan()
                );
            }
            _ => eprintln!("{}", "Usage: signup <email> <password> [username]".yellow()),
        },
        "login" => match args.as_slice() {
            [email, password] => {
                let me = client.sign_in(email, password).await?;
                println!("{} Signed in as {}", "✓".green().bold(), me.username.cyan().bold());
                print_contacts(client).await;
            }
            _ => eprintln!("{}", "Usage: login <email> <password>".yellow()),
        },
        "logout" => {
            client.sign_out().await?;
            println!("{} Signed out", "✓".green());
        }
        "contacts" => print_contacts(client).await,
        "reload" => {
            let count = client.refresh_contacts().await?;
            println!("{} {} contact(s)", "✓".green(), count);
        }
        "open" => {
            if rest.is_empty() {
                eprintln!("{}", "Usage: open <username|id>".yellow());
            } else {
                let peer = client.open_conversation(rest).await?;
                println!("{}", format!("── {} ──", peer.username).bright_cyan().bold());
                print_history(client).await;
            }
        }
        "close" => client.close_conversation().await?,
        "send" => send_text(client, rest).await?,
        "image" => {
            if rest.is_empty() {
                eprintln!("{}", "Usage: image <path>".yellow());
            } else if client.send_image(Path::new(rest)).await?.is_none() {
                eprintln!("{}", "Open a conversation first".yellow());
            }
        }
        "retry" => match client.last_failed_send().await {
            Some(token) => {
                client.retry_send(token).await?;
                println!("{} Sent", "✓".green());
            }
            None => println!("{}", "Nothing to retry".dimmed()),
        },
        "discard" => match client.last_failed_send().await {
            Some(token) => {
                client.discard_send(token).await?;
                println!("{} Discarded", "✓".green());
            }
            None => println!("{}", "Nothing to discard".dimmed()),
        },
        "history" => print_history(client).await,
        _ if client.open_peer().await.is_some() => send_text(client, line).await?,
        _ => {
            eprintln!("{} Unknown command: {}", "✗".red().bold(), command.red());
            print_help();
        }
    }
    Ok(None)
}

async fn send_text(client: &ChatClient, text: &str) -> crate::Result<()> {
    if client.open_peer().await.is_none() {
        eprintln!("{}", "Open a conversation first".yellow());
        return Ok(());
    }
    if let Err(e) = client.send_text(text).await {
        eprintln!("{}", "`retry` to send again, `discard` to drop it".dimmed());
        return Err(e);
    }
    Ok(())
}

/// Prints live events between prompts
fn spawn_event_printer(client: &ChatClient) -> tokio::task::JoinHandle<()> {
    let client = client.clone();
    let mut rx = client.subscribe_events();
    tokio::spawn(async move {
        loop {
            let event = match rx.recv().await {
                Ok(event) => event,
                Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            };
            match event {
                MessengerEvent::MessageAppended { message } => {
                    let Some(me) = client.me().await else { continue };
                    if message.sender_id != me.id {
                        let who = client
                            .open_peer()
                            .await
                            .map(|p| p.username)
                            .unwrap_or_else(|| message.sender_id.clone());
                        println!(
                            "\n{} {}: {}",
                            message.created_at.format("%H:%M").to_string().dimmed(),
                            who.bright_green(),
                            summarize_content(&message.content)
                        );
                    }
                }
                MessengerEvent::SendFailed { reason, .. } => {
                    eprintln!("\n{} Not sent: {}", "!".red().bold(), reason.red());
                }
                MessengerEvent::SyncFailed { reason, .. } => {
                    eprintln!("\n{} {}", "✗".red().bold(), reason.red());
                }
                MessengerEvent::ListenerStatus { live } => {
                    if live {
                        println!("\n{}", "● live".green());
                    } else {
                        println!("\n{}", "● offline, polling".yellow());
                    }
                }
                MessengerEvent::SignedOut => println!("\n{}", "Signed out".dimmed()),
                _ => {}
            }
        }
    })
}

async fn prompt(input: &mut Input, label: &str) -> anyhow::Result<Option<String>> {
    print!("{} ", format!("{}>", label).cyan());
    std::io::stdout().flush()?;
    Ok(input.next_line().await?)
}

async fn print_contacts(client: &ChatClient) {
    let contacts = client.contacts().await;
    if contacts.is_empty() {
        println!("{}", "No contacts yet".yellow());
        return;
    }
    println!("{}", format!("Contacts ({})", contacts.len()).bright_cyan().bold());
    println!("{}", "─".repeat(40).dimmed());
    for c in contacts {
        println!("  {} {}", c.username.cyan(), c.email.dimmed());
    }
}

async fn print_history(client: &ChatClient) {
    let (Some(me), Some(peer)) = (client.me().await, client.open_peer().await) else {
        println!("{}", "No conversation open".dimmed());
        return;
    };
    let timeline = client.timeline().await;
    if timeline.is_empty() {
        println!("{}", "No messages yet".dimmed());
    }
    for entry in &timeline {
        println!("{}", format_entry(entry, &me.id, &peer.username));
    }
}

fn format_entry(entry: &TimelineEntry, me_id: &str, peer_name: &str) -> String {
    let m = &entry.message;
    let time = m.created_at.format("%H:%M").to_string().dimmed();
    let body = summarize_content(&m.content);
    if m.sender_id == me_id {
        let icon = match entry.status {
            DeliveryStatus::Read => entry.status.status_icon().bright_blue(),
            DeliveryStatus::Failed => entry.status.status_icon().red().bold(),
            _ => entry.status.status_icon().dimmed(),
        };
        format!("{} {}: {} {}", time, "you".bright_white(), body, icon)
    } else {
        format!("{} {}: {}", time, peer_name.bright_green(), body)
    }
}

fn print_banner() {
    println!("{}", "💬 WhatsChat".bright_cyan().bold());
    println!("{}", "Type `help` for commands.".dimmed());
}

fn print_setup_screen() {
    println!();
    println!("{}", "Backend setup".bright_white().bold());
    println!("  No backend connection details found.");
    println!("  {} <url> <anon-key>   Save the project URL and public key", "setup".cyan());
    println!("  {}                    Use the local store instead", "local".cyan());
    println!("  {}                     Leave", "quit".cyan());
}

fn print_help() {
    println!("{}", "Commands:".bright_white().bold());
    println!("  {} <email> <password> [username]  Create an account", "signup".cyan());
    println!("  {} <email> <password>              Sign in", "login".cyan());
    println!("  {}                                Sign out", "logout".cyan());
    println!("  {}                              List contacts", "contacts".cyan());
    println!("  {}                                Reload contacts", "reload".cyan());
    println!("  {} <username|id>                    Open a conversation", "open".cyan());
    println!("  {}                                 Close the conversation", "close".cyan());
    println!("  {} <text>                           Send (plain text works too)", "send".cyan());
    println!("  {} <path>                          Send an image", "image".cyan());
    println!("  {}                                 Retry the last failed send", "retry".cyan());
    println!("  {}                               Drop the last failed send", "discard".cyan());
    println!("  {}                               Show the conversation", "history".cyan());
    println!("  {} <url> <key>                     Change backend", "setup".cyan());
    println!("  {}                            Forget backend details", "disconnect".cyan());
    println!("  {}                                  Leave", "quit".cyan());
}
