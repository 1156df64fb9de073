use crate::config::ClientConfig;
use crate::connection::ConnectionStatus;
use crate::game::ClientGame;
use crate::input::{parse_command, Command, HELP};
use crate::rendering::{RenderConfig, Renderer};
use log::{debug, error, info, warn};
use shared::clock::{Clock, SystemClock};
use shared::{Packet, MAX_PACKET_SIZE};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, watch};
use tokio::time::{interval, sleep};

const TICK_MS: u64 = 100;

pub struct Client {
    socket: UdpSocket,
    server_addr: SocketAddr,
    fake_ping_ms: u64,
    player_id: String,

    game: ClientGame,
    renderer: Renderer,
    clock: Arc<dyn Clock>,

    /// Working version and pending count last printed
    last_rendered: Option<(u64, usize)>,
}

impl Client {
    pub async fn new(config: ClientConfig) -> Result<Self, Box<dyn std::error::Error>> {
        Self::with_clock(config, Arc::new(SystemClock)).await
    }

    pub async fn with_clock(config: ClientConfig, clock: Arc<dyn Clock>) -> Result<Self, Box<dyn std::error::Error>> {
        let socket = UdpSocket::bind("0.0.0.0:0").await?;
        let server_addr = config.server_addr.parse()?;
        let game = ClientGame::new(&config, clock.now_ms());

        Ok(Client {
            socket,
            server_addr,
            fake_ping_ms: config.fake_ping_ms,
            player_id: config.player_id,
            game,
            renderer: Renderer::new(),
            clock,
            last_rendered: None,
        })
    }

    pub fn game(&self) -> &ClientGame {
        &self.game
    }

    async fn send_packet(&self, packet: &Packet) -> Result<(), Box<dyn std::error::Error>> {
        if self.fake_ping_ms > 0 {
            sleep(Duration::from_millis(self.fake_ping_ms / 2)).await;
        }

        let data = packet.encode()?;
        self.socket.send_to(&data, self.server_addr).await?;
        Ok(())
    }

    async fn send_all(&self, packets: Vec<Packet>) {
        for packet in packets {
            if let Err(e) = self.send_packet(&packet).await {
                error!("Error sending packet: {}", e);
            }
        }
    }

    fn render(&mut self, force: bool) {
        let state = self.game.state();
        let key = state.map(|s| (s.version, self.game.layer().pending().len()));
        if !force && key == self.last_rendered {
            return;
        }
        self.last_rendered = key;

        let latency = self.game.channel().latency();
        let config = RenderConfig {
            player_id: &self.player_id,
            status: self.game.status(),
            ping_ms: latency.last(),
            quality: latency.quality(),
            fake_ping_ms: self.fake_ping_ms,
            pending_updates: self.game.layer().pending().len(),
            unresolved_conflicts: self.game.layer().unresolved_conflicts().count(),
        };
        println!("{}", self.renderer.render(state, &config));
    }

    fn print_notices(&mut self) {
        for notice in self.game.take_notices() {
            println!("{}", self.renderer.render_notice(&notice));
        }
    }

    /// Returns true when the player asked to quit
    async fn handle_command(&mut self, line: &str) -> bool {
        let now = self.clock.now_ms();
        let command = match parse_command(line) {
            Ok(command) => command,
            Err(e) => {
                println!("{}", e);
                return false;
            }
        };

        match command {
            Command::Action(intent) => {
                let name = intent.name();
                match self.game.submit(intent, now) {
                    Ok(Some(packet)) => self.send_all(vec![packet]).await,
                    Ok(None) => println!("offline; {} will be sent after reconnecting", name),
                    Err(e) => println!("cannot {}: {}", name, e),
                }
                self.render(false);
            }
            Command::Status => self.render(true),
            Command::Sync => {
                let packet = self.game.request_sync();
                self.send_all(vec![packet]).await;
            }
            Command::Conflicts => {
                print!("{}", self.renderer.render_conflicts(self.game.layer().unresolved_conflicts()));
            }
            Command::Resolve {
                conflict_id,
                strategy,
            } => match self.game.resolve_conflict(conflict_id, strategy, now) {
                Ok(()) => self.render(true),
                Err(e) => println!("{}", e),
            },
            Command::Help => println!("{}", HELP),
            Command::Quit => return true,
        }
        false
    }

    /// Runs until the player quits, the command stream ends, shutdown is
    /// signalled, or the server ends the session for good.
    pub async fn run(
        &mut self,
        mut commands: mpsc::Receiver<String>,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<(), Box<dyn std::error::Error>> {
        info!("Connecting to {}...", self.server_addr);
        let connect = self.game.start(self.clock.now_ms());
        self.send_packet(&connect).await?;

        let mut tick_interval = interval(Duration::from_millis(TICK_MS));
        let mut buffer = vec![0u8; MAX_PACKET_SIZE];

        loop {
            tokio::select! {
                result = self.socket.recv_from(&mut buffer) => {
                    match result {
                        Ok((len, addr)) => {
                            if addr != self.server_addr {
                                debug!("Ignoring datagram from {}", addr);
                                continue;
                            }
                            if self.fake_ping_ms > 0 {
                                sleep(Duration::from_millis(self.fake_ping_ms / 2)).await;
                            }

                            match Packet::decode(&buffer[..len]) {
                                Ok(packet) => {
                                    let replies = self.game.handle_packet(packet, self.clock.now_ms());
                                    self.send_all(replies).await;
                                    self.print_notices();
                                    self.render(false);
                                }
                                Err(e) => warn!("Malformed packet from server: {}", e),
                            }
                        },
                        Err(e) => error!("Error receiving packet: {}", e),
                    }
                },

                line = commands.recv() => {
                    match line {
                        Some(line) => {
                            if self.handle_command(&line).await {
                                break;
                            }
                        }
                        None => break,
                    }
                },

                _ = tick_interval.tick() => {
                    let packets = self.game.tick(self.clock.now_ms());
                    self.send_all(packets).await;
                    self.print_notices();
                    self.render(false);
                },

                _ = shutdown.changed() => {
                    info!("Shutting down client");
                    break;
                },
            }

            if self.game.status() == ConnectionStatus::Disconnected {
                info!("Session ended");
                break;
            }
        }

        if let Some(goodbye) = self.game.shutdown() {
            let _ = self.send_packet(&goodbye).await;
        }

        Ok(())
    }
}
