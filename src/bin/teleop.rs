// Keyboard teleop: WASD move, space stop, X search, I status, Q quit
use crossterm::{
    event::{self, Event, KeyCode, KeyEvent, KeyEventKind},
    terminal::{disable_raw_mode, enable_raw_mode},
};
use std::time::Duration;
use tracing::{info, warn};

use follow_bot::config::SEND_TIMEOUT;
use follow_bot::messages::Command;
use follow_bot::relay::service::{request_intent, request_status};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    tracing_subscriber::fmt().with_env_filter("info").init();

    info!("Opening Zenoh session...");
    let session = zenoh::open(zenoh::Config::default()).await?;

    info!("Controls: WASD=move, space=stop, X=search, I=status, Q=quit");

    enable_raw_mode()?;
    let result = run_teleop(&session).await;
    disable_raw_mode()?;

    result
}

fn command_for(code: KeyCode) -> Option<Command> {
    match code {
        KeyCode::Char('w') => Some(Command::Forward),
        KeyCode::Char('s') => Some(Command::Backward),
        KeyCode::Char('a') => Some(Command::Left),
        KeyCode::Char('d') => Some(Command::Right),
        KeyCode::Char(' ') => Some(Command::Stop),
        KeyCode::Char('x') => Some(Command::Search),
        _ => None,
    }
}

async fn run_teleop(
    session: &zenoh::Session,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    loop {
        if !event::poll(Duration::from_millis(20))? {
            continue;
        }
        let Event::Key(KeyEvent { code, kind, .. }) = event::read()? else {
            continue;
        };
        // Key repeat would queue a burst per repeat; only act on presses
        if kind != KeyEventKind::Press {
            continue;
        }

        match code {
            KeyCode::Char('q') | KeyCode::Esc => break,
            KeyCode::Char('i') => match request_status(session, SEND_TIMEOUT).await {
                Ok(status) => info!("Status: {:?}", status),
                Err(e) => warn!("Status failed: {}", e),
            },
            code => {
                let Some(cmd) = command_for(code) else {
                    continue;
                };
                match request_intent(session, cmd, SEND_TIMEOUT).await {
                    Ok(response) if response.ok => info!("{} acknowledged", cmd),
                    Ok(response) => warn!(
                        "{} refused: {:?} {}",
                        cmd,
                        response.reason,
                        response.detail.unwrap_or_default()
                    ),
                    Err(e) => warn!("{} not delivered: {}", cmd, e),
                }
            }
        }
    }

    Ok(())
}
