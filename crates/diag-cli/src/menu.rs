//! Line-oriented menu
//!
//! Turns user input into controller commands. Holds only prompt state; the
//! session itself lives in the controller.

use obd_session::{Command, Endpoint};

/// Main menu text
pub const MAIN_MENU: &str = "\
1) Connect (auto-detect)
2) Select port and connect
3) Read trouble codes
4) Clear trouble codes
5) Reconnect
6) Disconnect
q) Quit";

/// What the caller should do with a line of input
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MenuAction {
    /// Hand the command to the controller
    Run(Command),
    /// Scan ports and call [`Menu::offer_ports`]
    ScanPorts,
    /// Print a message
    Message(String),
    /// Print the main menu
    ShowMenu,
    /// Exit
    Quit,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Prompt {
    Main,
    SelectPort(Vec<Endpoint>),
    ConfirmClear,
}

/// Prompt state machine
#[derive(Debug)]
pub struct Menu {
    prompt: Prompt,
}

impl Default for Menu {
    fn default() -> Self {
        Self::new()
    }
}

impl Menu {
    /// Start at the main menu
    pub fn new() -> Self {
        Self {
            prompt: Prompt::Main,
        }
    }

    /// Ask the user to pick one of `endpoints`
    pub fn offer_ports(&mut self, endpoints: Vec<Endpoint>) {
        if !endpoints.is_empty() {
            self.prompt = Prompt::SelectPort(endpoints);
        }
    }

    /// Interpret one line of input
    pub fn handle(&mut self, line: &str) -> MenuAction {
        let input = line.trim();
        match std::mem::replace(&mut self.prompt, Prompt::Main) {
            Prompt::Main => self.handle_main(input),
            Prompt::SelectPort(endpoints) => select_port(endpoints, input, &mut self.prompt),
            Prompt::ConfirmClear => {
                if matches!(input.to_lowercase().as_str(), "y" | "yes") {
                    MenuAction::Run(Command::ClearCodes)
                } else {
                    MenuAction::Message("Clear cancelled.".to_string())
                }
            }
        }
    }

    fn handle_main(&mut self, input: &str) -> MenuAction {
        match input {
            "1" => MenuAction::Run(Command::Connect(None)),
            "2" => MenuAction::ScanPorts,
            "3" => MenuAction::Run(Command::ReadCodes),
            "4" => {
                self.prompt = Prompt::ConfirmClear;
                MenuAction::Message(
                    "Clear all stored trouble codes? This also resets emission readiness. [y/N]"
                        .to_string(),
                )
            }
            "5" => MenuAction::Run(Command::Reconnect),
            "6" => MenuAction::Run(Command::Disconnect),
            "q" | "Q" | "quit" | "exit" => MenuAction::Quit,
            "" | "?" | "h" | "help" => MenuAction::ShowMenu,
            other => MenuAction::Message(format!("Unknown choice '{}'.", other)),
        }
    }
}

fn select_port(endpoints: Vec<Endpoint>, input: &str, prompt: &mut Prompt) -> MenuAction {
    if input.is_empty() || input.eq_ignore_ascii_case("c") {
        return MenuAction::Message("Port selection cancelled.".to_string());
    }
    let chosen = input
        .parse::<usize>()
        .ok()
        .and_then(|n| n.checked_sub(1))
        .and_then(|index| endpoints.get(index).cloned());
    match chosen {
        Some(endpoint) => MenuAction::Run(Command::Connect(Some(endpoint))),
        None => {
            let message = format!(
                "Enter a number between 1 and {}, or 'c' to cancel.",
                endpoints.len()
            );
            *prompt = Prompt::SelectPort(endpoints);
            MenuAction::Message(message)
        }
    }
}
