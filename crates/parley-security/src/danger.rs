/// Substrings that mark a shell command as destructive. Matched case-insensitively.
const DANGEROUS_PATTERNS: &[&str] = &[
    "rm -rf",
    "rm -fr",
    "rm -r ",
    "rm --recursive",
    "rm --no-preserve-root",
    "sudo rm",
    "mkfs",
    "dd if=",
    "> /dev/sd",
    "of=/dev/",
    "shred ",
    "wipefs",
    "fdisk",
    "shutdown",
    "reboot",
    "poweroff",
    "init 0",
    ":(){",
    "chmod -r 777",
    "chmod 777 /",
    "chown -r",
    "kill -9",
    "killall",
    "pkill",
    "git push --force",
    "git push -f",
    "git reset --hard",
    "git clean -fd",
    "drop database",
    "drop table",
    "truncate table",
    "format c:",
    "del /f",
    "rmdir /s",
];

/// Whether `command` matches the destructive-command denylist.
pub fn is_dangerous(command: &str) -> bool {
    let lowered = command.to_lowercase();
    DANGEROUS_PATTERNS
        .iter()
        .any(|pattern| lowered.contains(pattern))
}
