//! Pseudo terminals (e.g. the console of a simulated target) default to
//! cooked mode: echo, line buffering and signal characters.
//! We want control sequences to pass through untouched, so they are put in raw mode.

use crate::error::Error;

/// Paths which refer to pseudo terminals rather than real serial devices.
pub fn is_pseudo_terminal(path: &str) -> bool {
    path.starts_with("/dev/pts/")
}

#[cfg(unix)]
mod unix {
    use std::os::unix::io::AsRawFd;

    use nix::sys::termios::{
        self, ControlFlags, InputFlags, LocalFlags, OutputFlags, SetArg,
        SpecialCharacterIndices, Termios,
    };

    use crate::error::Error;

    /// Apply raw mode to terminal attributes:
    ///
    /// - No echo, no canonical (line) mode, no signal generation
    /// - No input translation (CR/NL mapping, stripping, flow control)
    /// - No output post processing
    /// - 8 data bits, no parity
    /// - Reads return whatever is available (`VMIN` 0) after at most
    ///   one decisecond (`VTIME` 1)
    pub(crate) fn make_raw(attributes: &mut Termios) {
        attributes.local_flags &= !(LocalFlags::ECHO | LocalFlags::ICANON | LocalFlags::ISIG);
        attributes.input_flags &= !(InputFlags::IGNBRK
            | InputFlags::BRKINT
            | InputFlags::PARMRK
            | InputFlags::ISTRIP
            | InputFlags::INLCR
            | InputFlags::IGNCR
            | InputFlags::ICRNL
            | InputFlags::IXON);
        attributes.output_flags &= !OutputFlags::OPOST;
        attributes.control_flags &= !(ControlFlags::CSIZE | ControlFlags::PARENB);
        attributes.control_flags |= ControlFlags::CS8;

        attributes.control_chars[SpecialCharacterIndices::VMIN as usize] = 0;
        attributes.control_chars[SpecialCharacterIndices::VTIME as usize] = 1;
    }

    pub(crate) fn configure<F: AsRawFd>(terminal: &F) -> Result<(), Error> {
        let fd = terminal.as_raw_fd();

        let mut attributes = termios::tcgetattr(fd)
            .map_err(|e| Error::Io(format!("Could not read terminal attributes: {e}")))?;

        make_raw(&mut attributes);

        termios::tcsetattr(fd, SetArg::TCSANOW, &attributes)
            .map_err(|e| Error::Io(format!("Could not set terminal attributes: {e}")))
    }
}

/// Put the terminal behind `terminal` into raw mode.
#[cfg(unix)]
pub fn configure<F: std::os::unix::io::AsRawFd>(terminal: &F) -> Result<(), Error> {
    unix::configure(terminal)
}

/// Raw mode is a termios concept; elsewhere there is nothing to do.
#[cfg(not(unix))]
pub fn configure<F>(_terminal: &F) -> Result<(), Error> {
    Ok(())
}
