mod usbfs;

mod events;

mod device;
pub use device::LinuxDevice;

use rustix::io::Errno;

use crate::{Error, ErrorKind};

pub(crate) fn errno_to_error(errno: Errno, message: &'static str) -> Error {
    let kind = match errno {
        Errno::NODEV | Errno::SHUTDOWN => ErrorKind::Disconnected,
        Errno::BUSY => ErrorKind::Busy,
        Errno::ACCESS | Errno::PERM => ErrorKind::PermissionDenied,
        Errno::NOENT => ErrorKind::NotFound,
        Errno::INVAL => ErrorKind::InvalidArgument,
        Errno::NOMEM => ErrorKind::OutOfMemory,
        Errno::NOSYS | Errno::OPNOTSUPP => ErrorKind::Unsupported,
        _ => ErrorKind::Other,
    };
    Error::with_code(kind, errno.raw_os_error() as u32, message)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errno_kinds() {
        let e = errno_to_error(Errno::NODEV, "gone");
        assert_eq!(e.kind(), ErrorKind::Disconnected);
        assert_eq!(e.os_error(), Some(Errno::NODEV.raw_os_error() as u32));
        assert_eq!(errno_to_error(Errno::ACCESS, "").kind(), ErrorKind::PermissionDenied);
        assert_eq!(errno_to_error(Errno::INVAL, "").kind(), ErrorKind::InvalidArgument);
        assert_eq!(errno_to_error(Errno::IO, "").kind(), ErrorKind::Other);
    }
}
