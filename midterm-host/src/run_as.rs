//! Run-as de-elevation: when the Host is started by a privileged service,
//! `MM_RUN_AS_USER*`/`MM_RUN_AS_UID`/`MM_RUN_AS_GID` name a user each child
//! shell should run as instead of the Host's own. `apply` shows what that
//! would look like on each platform, but nothing currently calls it:
//! `portable-pty`'s `CommandBuilder` has no pre-exec hook to run it between
//! fork and exec, so `HostCore::create_session` rejects the request
//! up front instead (fatal for that one session, never for the Host).

use midterm_core::config::RunAsTarget;
use midterm_core::CoreError;

/// What applying the run-as target to a freshly forked child would do,
/// if something ever called this between fork and exec. Nothing does
/// today -- see the module doc -- so this is exercised only by its own
/// unit test.
#[cfg(unix)]
#[allow(dead_code)]
pub fn apply(target: &RunAsTarget) -> Result<(), CoreError> {
    let Some(uid) = target.uid else { return Ok(()) };
    let gid = target.gid.unwrap_or(uid);
    // SAFETY: setgid must happen before setuid, or the process loses the
    // privilege needed to change its group. Both are one-shot syscalls
    // with no aliasing concerns; failures are reported, not ignored.
    let rc = unsafe { libc::setgid(gid) };
    if rc != 0 {
        return Err(CoreError::platform_unsupported(format!(
            "setgid({gid}) failed: {}",
            std::io::Error::last_os_error()
        )));
    }
    let rc = unsafe { libc::setuid(uid) };
    if rc != 0 {
        return Err(CoreError::platform_unsupported(format!(
            "setuid({uid}) failed: {}",
            std::io::Error::last_os_error()
        )));
    }
    Ok(())
}

/// On Windows, de-elevation needs `CreateProcessWithTokenW` with a token
/// looked up for `user`/`user_sid`, which `portable-pty` doesn't expose a
/// hook for. Encoded here as a named, honest gap rather than a silent
/// no-op: a configured target fails loudly instead of launching elevated.
#[cfg(windows)]
#[allow(dead_code)]
pub fn apply(target: &RunAsTarget) -> Result<(), CoreError> {
    if target.is_set() {
        return Err(CoreError::platform_unsupported(
            "run-as de-elevation requires CreateProcessWithTokenW, not reachable through portable-pty's spawn path",
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_target_is_a_no_op() {
        let target = RunAsTarget::default();
        assert!(!target.is_set());
        assert!(apply(&target).is_ok());
    }
}
