//! Line commands read from stdin by the daemon.

use vgc_core::{ElementId, ElementRegistry, ElementValue, LinkId};

#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    /// Known endpoints.
    List,
    /// Links with their state and counters.
    Links,
    Browse,
    StopBrowse,
    Connect(String),
    /// All links, or one.
    Disconnect(Option<LinkId>),
    /// Set an element's value and send it.
    Set(ElementId, ElementValue),
    Help,
}

pub const HELP: &str = "commands: list | links | browse | stop-browse | connect <name> | \
disconnect [link] | set <element> <value> | help";

impl Command {
    pub fn parse(line: &str, registry: &ElementRegistry) -> Result<Command, String> {
        let mut words = line.split_whitespace();
        let Some(verb) = words.next() else {
            return Err("empty command".into());
        };
        let rest: Vec<&str> = words.collect();
        match (verb, rest.as_slice()) {
            ("list", []) => Ok(Command::List),
            ("links" | "status", []) => Ok(Command::Links),
            ("browse", []) => Ok(Command::Browse),
            ("stop-browse", []) => Ok(Command::StopBrowse),
            ("help" | "?", _) => Ok(Command::Help),
            ("connect", [_, ..]) => Ok(Command::Connect(rest.join(" "))),
            ("disconnect", []) => Ok(Command::Disconnect(None)),
            ("disconnect", [link]) => {
                let n = link
                    .trim_start_matches("link#")
                    .parse::<u64>()
                    .map_err(|_| format!("bad link {link:?}"))?;
                Ok(Command::Disconnect(Some(LinkId(n))))
            }
            ("set", [element, value]) => {
                let id = registry
                    .id_of(element)
                    .or_else(|| element.parse::<ElementId>().ok().filter(|id| registry.get(*id).is_some()))
                    .ok_or_else(|| format!("unknown element {element:?}"))?;
                let kind = registry
                    .kind(id)
                    .ok_or_else(|| format!("unknown element {element:?}"))?;
                let value = ElementValue::parse(kind, value)
                    .ok_or_else(|| format!("{value:?} is not a {kind:?} value"))?;
                Ok(Command::Set(id, value))
            }
            _ => Err(format!("unrecognised command {line:?}; {HELP}")),
        }
    }
}
