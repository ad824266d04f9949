//! Built-in command implementations and the id registry.

pub mod bulk;
pub mod echo;
pub mod file_write;
pub mod kv;
pub mod logger_read;
pub mod state;

use crate::rpc::server::{CommandCtx, Outcome};
use bedrock::auth::AuthLevel;
use hashbrown::HashMap;
use lazy_static::lazy_static;

pub type CommandFn = fn(&mut CommandCtx) -> Outcome;

/// One entry in the command registry.
pub struct CommandSpec {
    pub id: u16,
    pub name: &'static str,
    pub min_auth: AuthLevel,
    pub run: CommandFn,
}

pub const ECHO: u16 = 1;
pub const CORE_STATE: u16 = 2;
pub const KV_READ: u16 = 3;
pub const KV_WRITE: u16 = 4;
pub const DATA_SENDER: u16 = 5;
pub const DATA_RECEIVER: u16 = 6;
pub const LOGGER_READ: u16 = 7;
pub const LOGGER_READ_AVAILABLE: u16 = 8;
pub const FILE_WRITE_BASIC: u16 = 9;

lazy_static! {
    static ref BUILTIN: HashMap<u16, &'static CommandSpec> = {
        let specs: [&'static CommandSpec; 9] = [
            &echo::COMMAND,
            &state::COMMAND,
            &kv::READ_COMMAND,
            &kv::WRITE_COMMAND,
            &bulk::SENDER_COMMAND,
            &bulk::RECEIVER_COMMAND,
            &logger_read::READ_COMMAND,
            &logger_read::READ_AVAILABLE_COMMAND,
            &file_write::COMMAND,
        ];

        let mut map = HashMap::new();
        for spec in specs.iter() {
            map.insert(spec.id, *spec);
        }
        map
    };
}

/// Lookup table from command id to implementation.
pub struct Registry {
    map: HashMap<u16, &'static CommandSpec>,
}

impl Registry {
    /// Registry pre-populated with every built-in command.
    pub fn builtin() -> Registry {
        Registry {
            map: BUILTIN.clone(),
        }
    }

    pub fn empty() -> Registry {
        Registry { map: HashMap::new() }
    }

    /// Add or replace a command.
    pub fn register(&mut self, spec: &'static CommandSpec) {
        self.map.insert(spec.id, spec);
    }

    #[inline]
    pub fn lookup(&self, command_id: u16) -> Option<&'static CommandSpec> {
        self.map.get(&command_id).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_registry_complete() {
        let registry = Registry::builtin();

        for id in &[
            ECHO,
            CORE_STATE,
            KV_READ,
            KV_WRITE,
            DATA_SENDER,
            DATA_RECEIVER,
            LOGGER_READ,
            LOGGER_READ_AVAILABLE,
            FILE_WRITE_BASIC,
        ] {
            let spec = registry.lookup(*id).unwrap();
            assert_eq!(spec.id, *id);
        }

        assert!(registry.lookup(0xFFFF).is_none());
    }

    #[test]
    fn test_sender_requires_network_auth() {
        let registry = Registry::builtin();

        assert_eq!(registry.lookup(DATA_SENDER).unwrap().min_auth, AuthLevel::Network);
        assert_eq!(registry.lookup(ECHO).unwrap().min_auth, AuthLevel::Device);
    }
}
