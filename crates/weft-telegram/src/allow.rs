//! Allow-list enforcement for the Telegram adapter.
//!
//! Deny-by-default: an empty list means no one is allowed. Matching is by
//! numeric Telegram user id; pairing mode (handled in the message handler)
//! is the only other way in.

/// Returns `true` when the given Telegram user may interact with the bot.
pub fn is_allowed(allowed_user_ids: &[u64], user_id: u64) -> bool {
    allowed_user_ids.contains(&user_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_list_denies_all() {
        assert!(!is_allowed(&[], 1));
    }

    #[test]
    fn listed_id_is_allowed() {
        assert!(is_allowed(&[5, 7], 7));
    }

    #[test]
    fn unlisted_id_is_denied() {
        assert!(!is_allowed(&[5, 7], 8));
    }
}
