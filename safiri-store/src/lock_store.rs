use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use safiri_core::models::{BookedSeat, SeatHold, SeatKey, SeatSlot};
use safiri_core::repository::{AcquireOutcome, PromoteOutcome, RepoResult, SeatLockStore};
use uuid::Uuid;

/// Process-local seat slots. Each operation runs under the shard lock of
/// its key via the DashMap entry API, so compare and write cannot interleave.
#[derive(Default)]
pub struct InMemorySeatLockStore {
    slots: DashMap<SeatKey, SeatSlot>,
}

impl InMemorySeatLockStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Physical slot count, expired holds included.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

#[async_trait]
impl SeatLockStore for InMemorySeatLockStore {
    async fn get(&self, key: &SeatKey) -> RepoResult<Option<SeatSlot>> {
        Ok(self.slots.get(key).map(|slot| slot.value().clone()))
    }

    async fn try_acquire(&self, hold: SeatHold, now: DateTime<Utc>) -> RepoResult<AcquireOutcome> {
        let outcome = match self.slots.entry(hold.key) {
            Entry::Occupied(mut entry) => {
                let conflict = match entry.get() {
                    SeatSlot::Booked(seat) => Some(AcquireOutcome::Booked(seat.clone())),
                    SeatSlot::Held(existing) if existing.is_live(now) => {
                        if existing.holder_user_id == hold.holder_user_id {
                            Some(AcquireOutcome::AlreadyHeld(existing.clone()))
                        } else {
                            Some(AcquireOutcome::HeldByOther(existing.clone()))
                        }
                    }
                    SeatSlot::Held(_) => None,
                };
                match conflict {
                    Some(outcome) => outcome,
                    None => {
                        entry.insert(SeatSlot::Held(hold.clone()));
                        AcquireOutcome::Acquired(hold)
                    }
                }
            }
            Entry::Vacant(entry) => {
                entry.insert(SeatSlot::Held(hold.clone()));
                AcquireOutcome::Acquired(hold)
            }
        };
        Ok(outcome)
    }

    async fn promote(
        &self,
        key: &SeatKey,
        holder: &str,
        booking_id: Uuid,
        expires_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> RepoResult<PromoteOutcome> {
        let Entry::Occupied(mut entry) = self.slots.entry(*key) else {
            return Ok(PromoteOutcome::Missing);
        };

        let outcome = match entry.get_mut() {
            SeatSlot::Booked(seat) => PromoteOutcome::Booked(seat.clone()),
            SeatSlot::Held(hold) if !hold.is_live(now) => PromoteOutcome::Missing,
            SeatSlot::Held(hold) if hold.holder_user_id != holder => {
                PromoteOutcome::HeldByOther(hold.clone())
            }
            SeatSlot::Held(hold) if hold.is_promoted() => PromoteOutcome::AlreadyPromoted(hold.clone()),
            SeatSlot::Held(hold) => {
                hold.booking_id = Some(booking_id);
                hold.expires_at = expires_at;
                PromoteOutcome::Promoted(hold.clone())
            }
        };
        Ok(outcome)
    }

    async fn mark_booked(
        &self,
        key: &SeatKey,
        booking_id: Uuid,
        now: DateTime<Utc>,
    ) -> RepoResult<bool> {
        let Entry::Occupied(mut entry) = self.slots.entry(*key) else {
            return Ok(false);
        };

        let booked = match entry.get() {
            SeatSlot::Booked(seat) => return Ok(seat.booking_id == booking_id),
            SeatSlot::Held(hold) if hold.booking_id == Some(booking_id) && hold.is_live(now) => {
                BookedSeat {
                    key: hold.key,
                    booking_id,
                    user_id: hold.holder_user_id.clone(),
                }
            }
            SeatSlot::Held(_) => return Ok(false),
        };
        entry.insert(SeatSlot::Booked(booked));
        Ok(true)
    }

    async fn release_hold(&self, key: &SeatKey, holder: &str) -> RepoResult<bool> {
        let removed = self.slots.remove_if(key, |_, slot| {
            matches!(slot, SeatSlot::Held(hold) if hold.holder_user_id == holder && !hold.is_promoted())
        });
        Ok(removed.is_some())
    }

    async fn release_booking(&self, key: &SeatKey, booking_id: Uuid) -> RepoResult<bool> {
        let removed = self.slots.remove_if(key, |_, slot| match slot {
            SeatSlot::Held(hold) => hold.booking_id == Some(booking_id),
            SeatSlot::Booked(seat) => seat.booking_id == booking_id,
        });
        Ok(removed.is_some())
    }

    async fn list(&self, vehicle_id: Uuid, travel_date: NaiveDate) -> RepoResult<Vec<SeatSlot>> {
        let mut slots: Vec<SeatSlot> = self
            .slots
            .iter()
            .filter(|entry| {
                entry.key().vehicle_id == vehicle_id && entry.key().travel_date == travel_date
            })
            .map(|entry| entry.value().clone())
            .collect();
        slots.sort_by_key(|slot| slot.key().seat_number);
        Ok(slots)
    }

    async fn evict_expired(&self, now: DateTime<Utc>) -> RepoResult<Vec<SeatKey>> {
        let mut evicted = Vec::new();
        self.slots.retain(|key, slot| {
            if slot.is_live(now) {
                true
            } else {
                evicted.push(*key);
                false
            }
        });
        Ok(evicted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use std::sync::Arc;

    fn start() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 2, 3, 7, 0, 0).unwrap()
    }

    fn seat(n: u32) -> SeatKey {
        SeatKey::new(
            Uuid::from_u128(42),
            NaiveDate::from_ymd_opt(2025, 2, 3).unwrap(),
            n,
        )
    }

    fn hold(n: u32, user: &str, now: DateTime<Utc>) -> SeatHold {
        SeatHold::new(seat(n), user, now, Duration::seconds(900))
    }

    #[tokio::test]
    async fn test_acquire_is_exclusive_until_expiry() {
        let store = InMemorySeatLockStore::new();
        let now = start();

        let first = store.try_acquire(hold(5, "alice", now), now).await.unwrap();
        assert!(matches!(first, AcquireOutcome::Acquired(_)));

        let again = store.try_acquire(hold(5, "alice", now), now).await.unwrap();
        assert!(matches!(again, AcquireOutcome::AlreadyHeld(h) if h.created_at == now));

        let later = now + Duration::seconds(899);
        let rival = store.try_acquire(hold(5, "bob", later), later).await.unwrap();
        assert!(matches!(rival, AcquireOutcome::HeldByOther(_)));

        let lapsed = now + Duration::seconds(900);
        let takeover = store.try_acquire(hold(5, "bob", lapsed), lapsed).await.unwrap();
        assert!(matches!(takeover, AcquireOutcome::Acquired(h) if h.holder_user_id == "bob"));
    }

    #[tokio::test]
    async fn test_promote_then_book() {
        let store = InMemorySeatLockStore::new();
        let now = start();
        let booking_id = Uuid::new_v4();
        store.try_acquire(hold(3, "alice", now), now).await.unwrap();

        let expiry = now + Duration::minutes(15);
        let promoted = store.promote(&seat(3), "alice", booking_id, expiry, now).await.unwrap();
        assert!(matches!(promoted, PromoteOutcome::Promoted(ref h) if h.expires_at == expiry));

        let repeat = store.promote(&seat(3), "alice", Uuid::new_v4(), expiry, now).await.unwrap();
        assert!(matches!(repeat, PromoteOutcome::AlreadyPromoted(h) if h.booking_id == Some(booking_id)));

        let stolen = store.promote(&seat(3), "bob", Uuid::new_v4(), expiry, now).await.unwrap();
        assert!(matches!(stolen, PromoteOutcome::HeldByOther(_)));

        // A promoted hold cannot be dropped through the plain release path.
        assert!(!store.release_hold(&seat(3), "alice").await.unwrap());

        assert!(store.mark_booked(&seat(3), booking_id, now).await.unwrap());
        assert!(store.mark_booked(&seat(3), booking_id, now).await.unwrap());
        assert!(!store.mark_booked(&seat(3), Uuid::new_v4(), now).await.unwrap());

        let blocked = store.try_acquire(hold(3, "bob", now), now).await.unwrap();
        assert!(matches!(blocked, AcquireOutcome::Booked(_)));
    }

    #[tokio::test]
    async fn test_promote_requires_live_hold() {
        let store = InMemorySeatLockStore::new();
        let now = start();
        let expiry = now + Duration::minutes(15);

        let none = store.promote(&seat(1), "alice", Uuid::new_v4(), expiry, now).await.unwrap();
        assert_eq!(none, PromoteOutcome::Missing);

        store.try_acquire(hold(1, "alice", now), now).await.unwrap();
        let late = now + Duration::seconds(901);
        let lapsed = store.promote(&seat(1), "alice", Uuid::new_v4(), expiry, late).await.unwrap();
        assert_eq!(lapsed, PromoteOutcome::Missing);
    }

    #[tokio::test]
    async fn test_mark_booked_rejects_lapsed_pending_hold() {
        let store = InMemorySeatLockStore::new();
        let now = start();
        let booking_id = Uuid::new_v4();
        store.try_acquire(hold(2, "alice", now), now).await.unwrap();
        store
            .promote(&seat(2), "alice", booking_id, now + Duration::minutes(15), now)
            .await
            .unwrap();

        let late = now + Duration::minutes(15);
        assert!(!store.mark_booked(&seat(2), booking_id, late).await.unwrap());
    }

    #[tokio::test]
    async fn test_release_only_touches_own_slot() {
        let store = InMemorySeatLockStore::new();
        let now = start();
        store.try_acquire(hold(7, "alice", now), now).await.unwrap();

        assert!(!store.release_hold(&seat(7), "bob").await.unwrap());
        assert!(!store.release_booking(&seat(7), Uuid::new_v4()).await.unwrap());
        assert!(store.release_hold(&seat(7), "alice").await.unwrap());
        assert!(store.get(&seat(7)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_evict_expired_keeps_live_and_booked() {
        let store = InMemorySeatLockStore::new();
        let now = start();
        let booking_id = Uuid::new_v4();

        store.try_acquire(hold(1, "alice", now), now).await.unwrap();
        store
            .try_acquire(
                SeatHold::new(seat(2), "bob", now, Duration::seconds(60)),
                now,
            )
            .await
            .unwrap();
        store.try_acquire(hold(3, "carol", now), now).await.unwrap();
        store
            .promote(&seat(3), "carol", booking_id, now + Duration::seconds(30), now)
            .await
            .unwrap();
        store.mark_booked(&seat(3), booking_id, now).await.unwrap();

        let evicted = store.evict_expired(now + Duration::seconds(61)).await.unwrap();
        assert_eq!(evicted, vec![seat(2)]);
        assert_eq!(store.len(), 2);

        let listed = store.list(Uuid::from_u128(42), seat(1).travel_date).await.unwrap();
        let numbers: Vec<u32> = listed.iter().map(|s| s.key().seat_number).collect();
        assert_eq!(numbers, vec![1, 3]);

        // Once the travel day is over the confirmed seat goes too.
        let day_over = seat(3).travel_day_end();
        let mut evicted = store.evict_expired(day_over - Duration::seconds(1)).await.unwrap();
        assert_eq!(evicted, vec![seat(1)]);
        evicted = store.evict_expired(day_over).await.unwrap();
        assert_eq!(evicted, vec![seat(3)]);
        assert!(store.is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn test_concurrent_acquire_has_single_winner() {
        let store = Arc::new(InMemorySeatLockStore::new());
        let now = start();

        let mut handles = Vec::new();
        for i in 0..64 {
            let store = Arc::clone(&store);
            handles.push(tokio::spawn(async move {
                let user = format!("user-{}", i);
                store.try_acquire(hold(9, &user, now), now).await.unwrap()
            }));
        }

        let mut winners = 0;
        let mut losers = 0;
        for handle in handles {
            match handle.await.unwrap() {
                AcquireOutcome::Acquired(_) => winners += 1,
                AcquireOutcome::HeldByOther(_) => losers += 1,
                other => panic!("unexpected outcome {:?}", other),
            }
        }
        assert_eq!(winners, 1);
        assert_eq!(losers, 63);
    }
}
