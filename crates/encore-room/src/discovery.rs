//! Paginated room listing.

use encore_protocol::{RoomListPage, RoomSummary, UserId};
use encore_store::{DiscoveryFilter, Store};

use crate::RoomError;

/// Offset of the first row of 1-based `page`.
///
/// Rejects `page <= 0`.
pub fn page_offset(page: i64, page_size: u32) -> Result<u64, RoomError> {
    if page <= 0 {
        return Err(RoomError::validation("page must be at least 1"));
    }
    let index = u64::try_from(page - 1)
        .map_err(|_| RoomError::validation("page out of range"))?;
    index
        .checked_mul(u64::from(page_size))
        .ok_or_else(|| RoomError::validation("page out of range"))
}

/// Whether rows exist after a page holding `returned` rows at `offset`.
pub fn has_more(offset: u64, returned: usize, total: u64) -> bool {
    offset.saturating_add(returned as u64) < total
}

/// Lists the rooms `user` can see, one page at a time.
///
/// Visible rooms are open rooms plus rooms the user is invited to, minus
/// the user's current room. Private rooms the user is invited to come
/// first, then open rooms they are invited to, then every other open room;
/// oldest first within each group.
pub async fn discover(
    store: &dyn Store,
    user: UserId,
    page: i64,
    search_query: Option<&str>,
    page_size: u32,
) -> Result<RoomListPage, RoomError> {
    let offset = page_offset(page, page_size)?;
    let viewer = store
        .get_user(user)
        .await?
        .ok_or(RoomError::UserNotFound(user))?;

    let filter = DiscoveryFilter {
        user_id: user,
        exclude_room: viewer.current_room,
        search: search_query
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string),
        offset,
        limit: u64::from(page_size),
    };
    let (rooms, total) = store.discover_rooms(&filter).await?;

    tracing::debug!(%user, page, total, returned = rooms.len(), "rooms discovered");

    Ok(RoomListPage {
        has_more: has_more(offset, rooms.len(), total),
        data: rooms
            .into_iter()
            .map(|d| RoomSummary {
                room_id: d.room.id,
                name: d.room.name,
                creator_id: d.room.creator_id,
                is_open: d.room.is_open,
                is_invited: d.is_invited,
            })
            .collect(),
        page,
        total_entries: total,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_page_offset_rejects_non_positive_pages() {
        assert!(matches!(page_offset(0, 10), Err(RoomError::Validation(_))));
        assert!(matches!(page_offset(-3, 10), Err(RoomError::Validation(_))));
    }

    #[test]
    fn test_page_offset_first_pages() {
        assert_eq!(page_offset(1, 10).unwrap(), 0);
        assert_eq!(page_offset(3, 10).unwrap(), 20);
    }

    #[test]
    fn test_page_offset_overflow_is_rejected() {
        assert!(page_offset(i64::MAX, u32::MAX).is_err());
    }

    #[test]
    fn test_has_more_boundaries() {
        assert!(has_more(0, 10, 22));
        assert!(has_more(10, 10, 22));
        assert!(!has_more(20, 2, 22));
        assert!(!has_more(30, 0, 22));
    }

    proptest! {
        #[test]
        fn prop_pages_partition_the_listing(total in 0u64..200, page_size in 1u32..25) {
            // Walking pages until has_more is false visits every row once.
            let mut seen = 0u64;
            let mut page = 1i64;
            loop {
                let offset = page_offset(page, page_size).unwrap();
                let returned = total.saturating_sub(offset).min(u64::from(page_size)) as usize;
                seen += returned as u64;
                if !has_more(offset, returned, total) {
                    break;
                }
                page += 1;
            }
            prop_assert_eq!(seen, total);
        }
    }
}
