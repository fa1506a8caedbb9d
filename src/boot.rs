//! Kernel command-line handling: a whitespace-separated list of options
//! followed by actions, executed in order after boot.

use alloc::string::String;
use alloc::vec::Vec;

use crate::drivers::block::BlockRole;
use crate::drivers::shutdown::{self, ShutdownMode};
use crate::println;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// Run a user program and wait for it.
    Run(String),
    Ls,
    Cat(String),
    Rm(String),
    Extract,
    Append(String),
}

#[derive(Debug, Default)]
pub struct BootConfig {
    pub format_filesys: bool,
    pub mlfqs: bool,
    pub filesys_name: Option<String>,
    pub scratch_name: Option<String>,
    pub swap_name: Option<String>,
    pub random_seed: Option<u64>,
    pub user_page_limit: Option<usize>,
    pub print_usage: bool,
    pub shutdown: ShutdownMode,
    pub actions: Vec<Action>,
}

/// Split the command line into tokens, honoring single quotes so that
/// `run 'prog arg1 arg2'` stays one token.
fn tokenize(cmdline: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    for c in cmdline.chars() {
        match c {
            '\'' => in_quotes = !in_quotes,
            c if c.is_whitespace() && !in_quotes => {
                if !current.is_empty() {
                    tokens.push(core::mem::take(&mut current));
                }
            }
            c => current.push(c),
        }
    }
    if !current.is_empty() {
        tokens.push(current);
    }
    tokens
}

/// Parse options (leading '-') and the action list that follows them.
/// Unknown options and malformed actions panic, like any other
/// unbootable configuration.
pub fn parse(cmdline: &str) -> BootConfig {
    let tokens = tokenize(cmdline);
    let mut config = BootConfig::default();

    let mut iter = tokens.into_iter().peekable();
    while let Some(token) = iter.peek() {
        if !token.starts_with('-') {
            break;
        }
        let token = iter.next().unwrap();
        let (name, value) = match token.split_once('=') {
            Some((n, v)) => (String::from(n), Some(String::from(v))),
            None => (token, None),
        };
        match name.as_str() {
            "-h" => config.print_usage = true,
            "-q" => config.shutdown = ShutdownMode::PowerOff,
            "-r" => config.shutdown = ShutdownMode::Reboot,
            "-f" => config.format_filesys = true,
            "-filesys" => config.filesys_name = value,
            "-scratch" => config.scratch_name = value,
            "-swap" => config.swap_name = value,
            "-rs" => {
                config.random_seed = value.as_deref().and_then(|v| v.parse().ok());
            }
            "-mlfqs" => config.mlfqs = true,
            "-ul" => {
                config.user_page_limit = value.as_deref().and_then(|v| v.parse().ok());
            }
            other => panic!("unknown option `{}' (use -h for help)", other),
        }
    }

    while let Some(token) = iter.next() {
        let action = match token.as_str() {
            "run" => Action::Run(expect_arg(&mut iter, "run")),
            "ls" => Action::Ls,
            "cat" => Action::Cat(expect_arg(&mut iter, "cat")),
            "rm" => Action::Rm(expect_arg(&mut iter, "rm")),
            "extract" => Action::Extract,
            "append" => Action::Append(expect_arg(&mut iter, "append")),
            other => panic!("unknown action `{}' (use -h for help)", other),
        };
        config.actions.push(action);
    }
    config
}

fn expect_arg(iter: &mut impl Iterator<Item = String>, action: &str) -> String {
    match iter.next() {
        Some(arg) => arg,
        None => panic!("action `{}' requires an argument", action),
    }
}

/// Bind disks to their roles, honoring -filesys/-scratch/-swap overrides.
/// Default assignment follows probe order: hda, hdb, hdc.
pub fn assign_block_roles(config: &BootConfig) {
    crate::drivers::block::assign_role(BlockRole::FileSys, config.filesys_name.as_deref(), 0);
    crate::drivers::block::assign_role(BlockRole::Scratch, config.scratch_name.as_deref(), 1);
    crate::drivers::block::assign_role(BlockRole::Swap, config.swap_name.as_deref(), 2);
}

/// Execute the configured actions in order.
pub fn run_actions(config: &BootConfig) {
    for action in &config.actions {
        match action {
            Action::Run(task) => run_task(task),
            Action::Ls => crate::fs::fsutil::ls(),
            Action::Cat(path) => crate::fs::fsutil::cat(path),
            Action::Rm(path) => crate::fs::fsutil::rm(path),
            Action::Extract => crate::fs::fsutil::extract(),
            Action::Append(path) => crate::fs::fsutil::append(path),
        }
    }
}

fn run_task(task: &str) {
    println!("Executing '{}':", task);
    match crate::scheduler::process::execute(task) {
        Some(tid) => {
            crate::scheduler::process::wait(tid);
        }
        None => println!("run: cannot start '{}'", task),
    }
    println!("Execution of '{}' complete.", task);
}

/// -h: describe the command line, then power off.
pub fn usage() -> ! {
    println!(
        "\nCommand line syntax: [OPTION...] [ACTION...]\n\
         Options must precede actions.\n\
         Actions are executed in the order specified.\n\
         \nAvailable actions:\n\
         \x20 run 'PROG [ARG...]' Run PROG and wait for it to complete.\n\
         \x20 ls                 List files in the root directory.\n\
         \x20 cat FILE           Print FILE to the console.\n\
         \x20 rm FILE            Delete FILE.\n\
         \x20 extract            Untar from scratch device into file system.\n\
         \x20 append FILE        Append FILE to tar file on scratch device.\n\
         \nOptions:\n\
         \x20 -h                 Print this help message and power off.\n\
         \x20 -q                 Power off after actions or on panic.\n\
         \x20 -r                 Reboot after actions.\n\
         \x20 -f                 Format file system device during startup.\n\
         \x20 -filesys=BDEV      Use BDEV for file system instead of default.\n\
         \x20 -scratch=BDEV      Use BDEV for scratch instead of default.\n\
         \x20 -swap=BDEV         Use BDEV for swap instead of default.\n\
         \x20 -rs=SEED           Set random number seed to SEED.\n\
         \x20 -mlfqs             Use multi-level feedback queue scheduler.\n\
         \x20 -ul=COUNT          Limit user memory to COUNT pages."
    );
    shutdown::power_off()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tokenizer_honors_quotes() {
        assert_eq!(
            tokenize("run 'echo a b' ls"),
            alloc::vec![
                String::from("run"),
                String::from("echo a b"),
                String::from("ls")
            ]
        );
        assert_eq!(tokenize("   "), Vec::<String>::new());
    }

    #[test]
    fn options_then_actions() {
        let config = parse("-q -f -mlfqs -ul=256 -rs=42 run 'prog x' ls cat readme");
        assert_eq!(config.shutdown, ShutdownMode::PowerOff);
        assert!(config.format_filesys);
        assert!(config.mlfqs);
        assert_eq!(config.user_page_limit, Some(256));
        assert_eq!(config.random_seed, Some(42));
        assert_eq!(
            config.actions,
            alloc::vec![
                Action::Run(String::from("prog x")),
                Action::Ls,
                Action::Cat(String::from("readme")),
            ]
        );
    }

    #[test]
    fn device_name_overrides() {
        let config = parse("-filesys=hdb -scratch=hdc -swap=hdd");
        assert_eq!(config.filesys_name.as_deref(), Some("hdb"));
        assert_eq!(config.scratch_name.as_deref(), Some("hdc"));
        assert_eq!(config.swap_name.as_deref(), Some("hdd"));
        assert!(config.actions.is_empty());
    }

    #[test]
    #[should_panic(expected = "unknown option")]
    fn unknown_option_panics() {
        parse("-bogus");
    }

    #[test]
    #[should_panic(expected = "requires an argument")]
    fn action_without_argument_panics() {
        parse("cat");
    }
}
