use std::sync::Arc;

use smc_voice_intake::audio::AlsaAudioSystem;
use smc_voice_intake::config::Config;
use smc_voice_intake::gui_bridge::{GuiBridge, GuiEvent, connect_session};
use smc_voice_intake::net_link::WsConnector;
use smc_voice_intake::session::{SessionEvent, SessionManager};
use smc_voice_intake::tool_bridge::TicketRecord;
use tokio::signal;
use tokio::sync::mpsc;

fn print_ticket(ticket: &TicketRecord) {
    println!("==================== TICKET ====================");
    println!("  Nombre:        {}", ticket.name);
    println!("  Email:         {}", ticket.email);
    println!("  Municipalidad: {}", ticket.municipality);
    println!("  Sistema:       {}", ticket.system);
    println!("  Problema:      {}", ticket.issue);
    println!("================================================");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // 初始化日志
    env_logger::init();

    // 加载配置
    let config = Config::load()?;
    if config.service.api_key.is_empty() {
        log::warn!("No API key configured (service.api_key / GEMINI_API_KEY)");
    }

    // GUI进程通道
    let (tx_gui_event, mut rx_gui_event) = mpsc::channel::<GuiEvent>(100);

    // 启动GUI桥，与GUI进程通信
    let gui_bridge = if config.gui.enabled {
        let bridge = Arc::new(GuiBridge::new(&config.gui, tx_gui_event).await?);
        let bridge_clone = bridge.clone();
        tokio::spawn(async move {
            if let Err(e) = bridge_clone.run().await {
                log::error!("GuiBridge error: {}", e);
            }
        });
        Some(bridge)
    } else {
        drop(tx_gui_event);
        None
    };

    let audio = Arc::new(AlsaAudioSystem::new(config.audio.clone()));
    let connector = Arc::new(WsConnector::new(
        config.service.clone(),
        config.session.command_buffer,
    ));

    // 会话事件通道
    let (tx_session_event, mut rx_session_event) = mpsc::unbounded_channel::<SessionEvent>();
    let mut session = SessionManager::new(config, audio, connector, tx_session_event);

    println!("SMC voice intake started. Press Ctrl+C to exit.");
    connect_session(&mut session, gui_bridge.as_deref()).await;

    loop {
        tokio::select! {
            // 监听 Ctrl+C 信号
            _ = signal::ctrl_c() => {
                println!("Received Ctrl+C, shutting down...");
                session.disconnect().await;
                break;
            }

            Some(event) = rx_session_event.recv() => {
                match &event {
                    SessionEvent::Connected => println!("Session connected"),
                    SessionEvent::Disconnected => println!("Session disconnected"),
                    SessionEvent::Error(e) => eprintln!("Session error: {}", e),
                    SessionEvent::VolumeChanged(_) => {}
                    SessionEvent::Transcription { speaker, turn_complete, turn, .. } => {
                        if *turn_complete {
                            println!("[{}] {}", speaker.as_str(), turn.text);
                        }
                    }
                    SessionEvent::TicketSubmitted(ticket) => print_ticket(ticket),
                }

                if let Some(gui) = &gui_bridge {
                    if let Err(e) = gui.send_event(&event).await {
                        log::warn!("Failed to send to GUI: {}", e);
                    }
                }
            }

            Some(event) = rx_gui_event.recv() => {
                log::info!("Received command from GUI: {:?}", event);
                match event {
                    GuiEvent::Connect => {
                        connect_session(&mut session, gui_bridge.as_deref()).await
                    }
                    GuiEvent::Disconnect => session.disconnect().await,
                    GuiEvent::Toggle => {
                        if session.state().is_active() {
                            session.disconnect().await;
                        } else {
                            connect_session(&mut session, gui_bridge.as_deref()).await;
                        }
                    }
                }
            }
        }
    }

    // 事件通道中可能还有最后的断开通知
    while let Ok(event) = rx_session_event.try_recv() {
        if let Some(gui) = &gui_bridge {
            let _ = gui.send_event(&event).await;
        }
    }
    Ok(())
}
