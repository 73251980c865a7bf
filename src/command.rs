//! Remote command construction.
//!
//! A [`Command`] is a text invocation template. Templates may be written
//! with newlines/tabs for readability; those are stripped at construction
//! so the remote shell always sees a single logical line.

use std::fmt;

use anyhow::{bail, Result};

/// A command to be executed on a remote system.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command(String);

impl Command {
    /// Create a new command from the given template, stripping any
    /// line-continuations, newlines and tabs used for readability.
    pub fn new(template: impl AsRef<str>) -> Self {
        let stripped = template
            .as_ref()
            .replace("\\\n", "")
            .replace('\n', "")
            .replace('\t', "");

        Command(stripped)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// The platform of a remote machine.
///
/// Only Linux is supported, however, package managers and package names
/// differ between distributions; this is where logical operations get
/// translated into package-manager specific command text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Platform {
    Ubuntu2004,
    AmazonLinux2,
}

impl Platform {
    /// Determine the platform from the `ID`/`VERSION_ID` fields of the
    /// remote machine's `/etc/os-release`.
    pub fn from_os_release(distro: &str, release: &str) -> Result<Self> {
        match (distro, release) {
            ("ubuntu", "20.04") => Ok(Platform::Ubuntu2004),
            ("amzn", "2") => Ok(Platform::AmazonLinux2),
            _ => bail!("unsupported platform '{distro} {release}'"),
        }
    }

    /// The extension used by this platform's package manager.
    pub fn package_extension(self) -> &'static str {
        match self {
            Platform::Ubuntu2004 => "deb",
            Platform::AmazonLinux2 => "rpm",
        }
    }

    /// Package names which must be present for provisioning/benchmarking to
    /// work; installed up-front if missing.
    pub fn dependencies(self) -> &'static [&'static str] {
        match self {
            Platform::Ubuntu2004 => &["awscli", "libtinfo5"],
            Platform::AmazonLinux2 => &["awscli", "ncurses-compat-libs"],
        }
    }

    /// Command which installs the package file at the given remote path.
    pub fn command_install_package_at(self, path: &str) -> Command {
        match self {
            Platform::Ubuntu2004 => Command::new(format!("dpkg -i {path}")),
            Platform::AmazonLinux2 => Command::new(format!("yum install -y {path}")),
        }
    }

    /// Command which installs the given packages by name.
    pub fn command_install_packages(self, packages: &[&str]) -> Command {
        let joined = packages.join(" ");

        match self {
            Platform::Ubuntu2004 => Command::new(format!("apt update && apt install -y {joined}")),
            Platform::AmazonLinux2 => {
                Command::new(format!("yum update -y && yum install -y {joined}"))
            }
        }
    }

    /// Command which uninstalls the given packages by name.
    pub fn command_uninstall_packages(self, packages: &[&str]) -> Command {
        let joined = packages.join(" ");

        match self {
            Platform::Ubuntu2004 => Command::new(format!("dpkg --purge {joined}")),
            Platform::AmazonLinux2 => Command::new(format!("yum autoremove -y {joined}")),
        }
    }

    /// Command which stops and disables the storage engine service.
    pub fn command_disable_service(self) -> Command {
        match self {
            Platform::Ubuntu2004 | Platform::AmazonLinux2 => Command::new(format!(
                "systemctl disable --now {}",
                crate::config::SERVICE_NAME
            )),
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Platform::Ubuntu2004 => f.write_str("ubuntu20.04"),
            Platform::AmazonLinux2 => f.write_str("amzn2"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_strips_readability_whitespace() {
        let command = Command::new(
            "kvstore-cli bucket-create --bucket default \\\n\t--bucket-ramsize $QUOTA",
        );

        assert_eq!(
            command.as_str(),
            "kvstore-cli bucket-create --bucket default --bucket-ramsize $QUOTA",
        );
    }

    #[test]
    fn new_preserves_plain_commands() {
        assert_eq!(Command::new("sync").as_str(), "sync");
    }

    #[test]
    fn platform_from_os_release() {
        assert_eq!(
            Platform::from_os_release("ubuntu", "20.04").unwrap(),
            Platform::Ubuntu2004
        );
        assert_eq!(
            Platform::from_os_release("amzn", "2").unwrap(),
            Platform::AmazonLinux2
        );
        assert!(Platform::from_os_release("gentoo", "17.1").is_err());
    }

    #[test]
    fn platform_command_text() {
        assert_eq!(
            Platform::Ubuntu2004
                .command_install_packages(&["awscli", "libtinfo5"])
                .as_str(),
            "apt update && apt install -y awscli libtinfo5",
        );
        assert_eq!(
            Platform::AmazonLinux2
                .command_install_package_at("/tmp/kvstore-server.rpm")
                .as_str(),
            "yum install -y /tmp/kvstore-server.rpm",
        );
        assert_eq!(
            Platform::Ubuntu2004.command_disable_service().as_str(),
            "systemctl disable --now kvstore-server",
        );
    }
}
