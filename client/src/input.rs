//! Typed command parsing for the terminal client

use crate::optimistic::ConflictStrategy;
use shared::state::{GameSettings, MissionVote, VoteChoice};
use shared::Intent;
use thiserror::Error;

/// One line of player input
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Action(Intent),
    Status,
    Sync,
    Conflicts,
    Resolve {
        conflict_id: u64,
        strategy: ConflictStrategy,
    },
    Help,
    Quit,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("empty command")]
    Empty,

    #[error("unknown command '{0}', type 'help' for a list")]
    Unknown(String),

    #[error("usage: {0}")]
    Usage(&'static str),

    #[error("'{0}' is not a number")]
    NotANumber(String),

    #[error("{0}")]
    Strategy(String),
}

pub const HELP: &str = "\
commands:
  ready | unready              toggle your ready flag (lobby, role reveal)
  settings <min> <max>         change player bounds (host, lobby)
  start                        start the game (host)
  team <id> <id> ...           propose a mission team (leader)
  approve | reject             vote on the proposed team
  success | fail               vote on the mission (team members)
  assassinate <id>             guess Merlin (assassin)
  leave                        leave the room
  status                       show the room
  sync                         ask the server for a full state
  conflicts                    list conflicts waiting for a decision
  resolve <id> <strategy>      server_wins, client_wins, merge, timestamp, discard
  help | quit";

pub fn parse_command(line: &str) -> Result<Command, ParseError> {
    let mut words = line.split_whitespace();
    let Some(head) = words.next() else {
        return Err(ParseError::Empty);
    };
    let args: Vec<&str> = words.collect();

    let command = match head.to_ascii_lowercase().as_str() {
        "ready" => Command::Action(Intent::PlayerReadyChanged { ready: true }),
        "unready" => Command::Action(Intent::PlayerReadyChanged { ready: false }),
        "start" => Command::Action(Intent::StartGame),
        "leave" => Command::Action(Intent::LeaveRoom),
        "approve" | "yes" => Command::Action(Intent::VoteCast {
            choice: VoteChoice::Approve,
        }),
        "reject" | "no" => Command::Action(Intent::VoteCast {
            choice: VoteChoice::Reject,
        }),
        "success" => Command::Action(Intent::MissionVoteCast {
            vote: MissionVote::Success,
        }),
        "fail" | "failure" => Command::Action(Intent::MissionVoteCast {
            vote: MissionVote::Failure,
        }),
        "team" => {
            if args.is_empty() {
                return Err(ParseError::Usage("team <id> <id> ..."));
            }
            Command::Action(Intent::MissionTeamSelected {
                team: args.iter().map(|id| id.to_string()).collect(),
            })
        }
        "assassinate" | "kill" => match args.as_slice() {
            [target] => Command::Action(Intent::Assassinate {
                target_id: target.to_string(),
            }),
            _ => return Err(ParseError::Usage("assassinate <id>")),
        },
        "settings" => match args.as_slice() {
            [min, max] => Command::Action(Intent::UpdateSettings {
                settings: GameSettings {
                    min_players: parse_number(min)?,
                    max_players: parse_number(max)?,
                },
            }),
            _ => return Err(ParseError::Usage("settings <min> <max>")),
        },
        "resolve" => match args.as_slice() {
            [id, strategy] => Command::Resolve {
                conflict_id: parse_number(id)?,
                strategy: strategy.parse().map_err(ParseError::Strategy)?,
            },
            _ => return Err(ParseError::Usage("resolve <id> <strategy>")),
        },
        "status" | "s" => Command::Status,
        "sync" => Command::Sync,
        "conflicts" => Command::Conflicts,
        "help" | "?" => Command::Help,
        "quit" | "exit" | "q" => Command::Quit,
        other => return Err(ParseError::Unknown(other.to_string())),
    };
    Ok(command)
}

fn parse_number<T: std::str::FromStr>(word: &str) -> Result<T, ParseError> {
    word.parse().map_err(|_| ParseError::NotANumber(word.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::{assert_err, assert_ok};

    #[test]
    fn test_simple_actions() {
        assert_eq!(
            parse_command("ready"),
            Ok(Command::Action(Intent::PlayerReadyChanged { ready: true }))
        );
        assert_eq!(
            parse_command("  APPROVE "),
            Ok(Command::Action(Intent::VoteCast {
                choice: VoteChoice::Approve
            }))
        );
        assert_eq!(
            parse_command("fail"),
            Ok(Command::Action(Intent::MissionVoteCast {
                vote: MissionVote::Failure
            }))
        );
        assert_eq!(parse_command("q"), Ok(Command::Quit));
    }

    #[test]
    fn test_team_keeps_order() {
        assert_eq!(
            parse_command("team p3 p1"),
            Ok(Command::Action(Intent::MissionTeamSelected {
                team: vec!["p3".to_string(), "p1".to_string()]
            }))
        );
        assert_eq!(parse_command("team"), Err(ParseError::Usage("team <id> <id> ...")));
    }

    #[test]
    fn test_settings_and_resolve_arguments() {
        assert_eq!(
            parse_command("settings 5 8"),
            Ok(Command::Action(Intent::UpdateSettings {
                settings: GameSettings {
                    min_players: 5,
                    max_players: 8
                }
            }))
        );
        assert_eq!(
            parse_command("settings five 8"),
            Err(ParseError::NotANumber("five".to_string()))
        );
        assert_eq!(
            parse_command("resolve 3 client-wins"),
            Ok(Command::Resolve {
                conflict_id: 3,
                strategy: ConflictStrategy::ClientWins
            })
        );
        assert!(matches!(parse_command("resolve 3 newest"), Err(ParseError::Strategy(_))));
    }

    #[test]
    fn test_unknown_and_empty() {
        assert_eq!(parse_command("   "), Err(ParseError::Empty));
        assert_eq!(parse_command("dance"), Err(ParseError::Unknown("dance".to_string())));
    }

    #[test]
    fn test_info_commands() {
        assert_eq!(assert_ok!(parse_command("s")), Command::Status);
        assert_eq!(assert_ok!(parse_command("sync")), Command::Sync);
        assert_eq!(assert_ok!(parse_command("?")), Command::Help);
        assert_err!(parse_command("assassinate"));
    }
}
