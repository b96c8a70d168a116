use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use redis::{AsyncCommands, Script};
use safiri_core::models::{BookedSeat, SeatHold, SeatKey, SeatSlot};
use safiri_core::repository::{AcquireOutcome, PromoteOutcome, RepoResult, SeatLockStore};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use uuid::Uuid;

// Each script is one atomic step on one seat key. Every slot carries a PXAT so
// Redis drops it on its own: holds at their expiry, booked seats once the
// travel day is over.

const ACQUIRE_LUA: &str = r#"
    local current = redis.call("GET", KEYS[1])
    if current then
        local slot = cjson.decode(current)
        if slot.state == "booked" then
            return {"booked", current}
        end
        if tonumber(slot.expires_at_ms) > tonumber(ARGV[3]) then
            if slot.holder == ARGV[2] then
                return {"mine", current}
            end
            return {"other", current}
        end
    end
    redis.call("SET", KEYS[1], ARGV[1], "PXAT", ARGV[4])
    redis.call("SADD", KEYS[2], ARGV[5])
    return {"acquired", ARGV[1]}
"#;

const PROMOTE_LUA: &str = r#"
    local current = redis.call("GET", KEYS[1])
    if not current then
        return {"missing", ""}
    end
    local slot = cjson.decode(current)
    if slot.state == "booked" then
        return {"booked", current}
    end
    if tonumber(slot.expires_at_ms) <= tonumber(ARGV[4]) then
        return {"missing", ""}
    end
    if slot.holder ~= ARGV[1] then
        return {"other", current}
    end
    if slot.booking_id then
        return {"promoted_already", current}
    end
    slot.booking_id = ARGV[2]
    slot.expires_at_ms = tonumber(ARGV[3])
    local encoded = cjson.encode(slot)
    redis.call("SET", KEYS[1], encoded, "PXAT", ARGV[3])
    return {"promoted", encoded}
"#;

const MARK_BOOKED_LUA: &str = r#"
    local current = redis.call("GET", KEYS[1])
    if not current then
        return 0
    end
    local slot = cjson.decode(current)
    if slot.booking_id ~= ARGV[1] then
        return 0
    end
    if slot.state == "booked" then
        return 1
    end
    if tonumber(slot.expires_at_ms) <= tonumber(ARGV[2]) then
        return 0
    end
    slot.state = "booked"
    slot.expires_at_ms = nil
    redis.call("SET", KEYS[1], cjson.encode(slot), "PXAT", ARGV[3])
    return 1
"#;

const RELEASE_HOLD_LUA: &str = r#"
    local current = redis.call("GET", KEYS[1])
    if not current then
        return 0
    end
    local slot = cjson.decode(current)
    if slot.state ~= "held" or slot.holder ~= ARGV[1] or slot.booking_id then
        return 0
    end
    redis.call("DEL", KEYS[1])
    redis.call("SREM", KEYS[2], ARGV[2])
    return 1
"#;

const RELEASE_BOOKING_LUA: &str = r#"
    local current = redis.call("GET", KEYS[1])
    if not current then
        return 0
    end
    local slot = cjson.decode(current)
    if slot.booking_id ~= ARGV[1] then
        return 0
    end
    redis.call("DEL", KEYS[1])
    redis.call("SREM", KEYS[2], ARGV[2])
    return 1
"#;

/// Wire form of a slot as stored under `seat:{vehicle}:{date}:{seat}`.
#[derive(Debug, Serialize, Deserialize)]
struct RedisSlot {
    state: String,
    holder: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    booking_id: Option<Uuid>,
    created_at_ms: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    expires_at_ms: Option<i64>,
}

impl RedisSlot {
    fn from_hold(hold: &SeatHold) -> Self {
        Self {
            state: "held".to_string(),
            holder: hold.holder_user_id.clone(),
            booking_id: hold.booking_id,
            created_at_ms: hold.created_at.timestamp_millis(),
            expires_at_ms: Some(hold.expires_at.timestamp_millis()),
        }
    }

    fn into_slot(self, key: SeatKey) -> RepoResult<SeatSlot> {
        match self.state.as_str() {
            "held" => {
                let expires_at_ms = self.expires_at_ms.ok_or("held slot without expiry")?;
                Ok(SeatSlot::Held(SeatHold {
                    key,
                    holder_user_id: self.holder,
                    created_at: from_millis(self.created_at_ms)?,
                    expires_at: from_millis(expires_at_ms)?,
                    booking_id: self.booking_id,
                }))
            }
            "booked" => Ok(SeatSlot::Booked(BookedSeat {
                key,
                booking_id: self.booking_id.ok_or("booked slot without booking id")?,
                user_id: self.holder,
            })),
            other => Err(format!("unknown slot state: {}", other).into()),
        }
    }
}

fn from_millis(ms: i64) -> RepoResult<DateTime<Utc>> {
    DateTime::from_timestamp_millis(ms).ok_or_else(|| format!("timestamp out of range: {}", ms).into())
}

fn decode(key: SeatKey, raw: &str) -> RepoResult<SeatSlot> {
    let slot: RedisSlot = serde_json::from_str(raw)?;
    slot.into_slot(key)
}

fn decode_hold(key: SeatKey, raw: &str) -> RepoResult<SeatHold> {
    match decode(key, raw)? {
        SeatSlot::Held(hold) => Ok(hold),
        SeatSlot::Booked(_) => Err(format!("expected held slot at {}", key).into()),
    }
}

fn decode_booked(key: SeatKey, raw: &str) -> RepoResult<BookedSeat> {
    match decode(key, raw)? {
        SeatSlot::Booked(seat) => Ok(seat),
        SeatSlot::Held(_) => Err(format!("expected booked slot at {}", key).into()),
    }
}

fn seat_key(key: &SeatKey) -> String {
    format!("seat:{}:{}:{}", key.vehicle_id, key.travel_date, key.seat_number)
}

fn index_key(vehicle_id: Uuid, travel_date: NaiveDate) -> String {
    format!("seats:{}:{}", vehicle_id, travel_date)
}

/// Seat slots shared across API instances.
#[derive(Clone)]
pub struct RedisSeatLockStore {
    client: redis::Client,
    acquire: Script,
    promote: Script,
    mark_booked: Script,
    release_hold: Script,
    release_booking: Script,
}

impl RedisSeatLockStore {
    pub async fn new(connection_string: &str) -> Result<Self, redis::RedisError> {
        let client = redis::Client::open(connection_string)?;
        // Fail at startup rather than on the first hold.
        let mut conn = client.get_multiplexed_async_connection().await?;
        redis::cmd("PING").query_async::<String>(&mut conn).await?;
        info!("Connected to Redis seat lock store");

        Ok(Self {
            client,
            acquire: Script::new(ACQUIRE_LUA),
            promote: Script::new(PROMOTE_LUA),
            mark_booked: Script::new(MARK_BOOKED_LUA),
            release_hold: Script::new(RELEASE_HOLD_LUA),
            release_booking: Script::new(RELEASE_BOOKING_LUA),
        })
    }
}

#[async_trait]
impl SeatLockStore for RedisSeatLockStore {
    async fn get(&self, key: &SeatKey) -> RepoResult<Option<SeatSlot>> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let raw: Option<String> = conn.get(seat_key(key)).await?;
        raw.map(|raw| decode(*key, &raw)).transpose()
    }

    async fn try_acquire(&self, hold: SeatHold, now: DateTime<Utc>) -> RepoResult<AcquireOutcome> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let key = hold.key;
        let encoded = serde_json::to_string(&RedisSlot::from_hold(&hold))?;

        let (tag, raw): (String, String) = self
            .acquire
            .key(seat_key(&key))
            .key(index_key(key.vehicle_id, key.travel_date))
            .arg(encoded)
            .arg(&hold.holder_user_id)
            .arg(now.timestamp_millis())
            .arg(hold.expires_at.timestamp_millis())
            .arg(key.seat_number)
            .invoke_async(&mut conn)
            .await?;

        debug!("acquire {} -> {}", key, tag);
        match tag.as_str() {
            "acquired" => Ok(AcquireOutcome::Acquired(hold)),
            "mine" => Ok(AcquireOutcome::AlreadyHeld(decode_hold(key, &raw)?)),
            "other" => Ok(AcquireOutcome::HeldByOther(decode_hold(key, &raw)?)),
            "booked" => Ok(AcquireOutcome::Booked(decode_booked(key, &raw)?)),
            other => Err(format!("unexpected acquire result: {}", other).into()),
        }
    }

    async fn promote(
        &self,
        key: &SeatKey,
        holder: &str,
        booking_id: Uuid,
        expires_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> RepoResult<PromoteOutcome> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let (tag, raw): (String, String) = self
            .promote
            .key(seat_key(key))
            .arg(holder)
            .arg(booking_id.to_string())
            .arg(expires_at.timestamp_millis())
            .arg(now.timestamp_millis())
            .invoke_async(&mut conn)
            .await?;

        match tag.as_str() {
            "promoted" => Ok(PromoteOutcome::Promoted(decode_hold(*key, &raw)?)),
            "promoted_already" => Ok(PromoteOutcome::AlreadyPromoted(decode_hold(*key, &raw)?)),
            "missing" => Ok(PromoteOutcome::Missing),
            "other" => Ok(PromoteOutcome::HeldByOther(decode_hold(*key, &raw)?)),
            "booked" => Ok(PromoteOutcome::Booked(decode_booked(*key, &raw)?)),
            other => Err(format!("unexpected promote result: {}", other).into()),
        }
    }

    async fn mark_booked(
        &self,
        key: &SeatKey,
        booking_id: Uuid,
        now: DateTime<Utc>,
    ) -> RepoResult<bool> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let marked: i64 = self
            .mark_booked
            .key(seat_key(key))
            .arg(booking_id.to_string())
            .arg(now.timestamp_millis())
            .arg(key.travel_day_end().timestamp_millis())
            .invoke_async(&mut conn)
            .await?;
        Ok(marked == 1)
    }

    async fn release_hold(&self, key: &SeatKey, holder: &str) -> RepoResult<bool> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let released: i64 = self
            .release_hold
            .key(seat_key(key))
            .key(index_key(key.vehicle_id, key.travel_date))
            .arg(holder)
            .arg(key.seat_number)
            .invoke_async(&mut conn)
            .await?;
        Ok(released == 1)
    }

    async fn release_booking(&self, key: &SeatKey, booking_id: Uuid) -> RepoResult<bool> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let released: i64 = self
            .release_booking
            .key(seat_key(key))
            .key(index_key(key.vehicle_id, key.travel_date))
            .arg(booking_id.to_string())
            .arg(key.seat_number)
            .invoke_async(&mut conn)
            .await?;
        Ok(released == 1)
    }

    async fn list(&self, vehicle_id: Uuid, travel_date: NaiveDate) -> RepoResult<Vec<SeatSlot>> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let index = index_key(vehicle_id, travel_date);
        let mut seats: Vec<u32> = conn.smembers(&index).await?;
        seats.sort_unstable();
        if seats.is_empty() {
            return Ok(Vec::new());
        }

        let keys: Vec<SeatKey> = seats
            .iter()
            .map(|seat| SeatKey::new(vehicle_id, travel_date, *seat))
            .collect();
        let redis_keys: Vec<String> = keys.iter().map(seat_key).collect();
        let raws: Vec<Option<String>> = redis::cmd("MGET")
            .arg(&redis_keys)
            .query_async(&mut conn)
            .await?;

        let mut slots = Vec::with_capacity(raws.len());
        let mut stale = Vec::new();
        for (key, raw) in keys.into_iter().zip(raws) {
            match raw {
                Some(raw) => slots.push(decode(key, &raw)?),
                None => stale.push(key.seat_number),
            }
        }

        // Redis expired these holds; drop them from the index too.
        if !stale.is_empty() {
            conn.srem::<_, _, ()>(&index, stale).await?;
        }
        Ok(slots)
    }

    async fn evict_expired(&self, _now: DateTime<Utc>) -> RepoResult<Vec<SeatKey>> {
        // PXAT already removed expired holds and past booked seats; the index
        // is pruned lazily by `list`.
        Ok(Vec::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn key() -> SeatKey {
        SeatKey::new(
            Uuid::from_u128(7),
            NaiveDate::from_ymd_opt(2025, 3, 1).unwrap(),
            12,
        )
    }

    #[test]
    fn test_key_layout() {
        assert_eq!(
            seat_key(&key()),
            "seat:00000000-0000-0000-0000-000000000007:2025-03-01:12"
        );
        assert_eq!(
            index_key(key().vehicle_id, key().travel_date),
            "seats:00000000-0000-0000-0000-000000000007:2025-03-01"
        );
    }

    #[test]
    fn test_held_slot_wire_format() {
        let now = Utc.with_ymd_and_hms(2025, 3, 1, 6, 30, 0).unwrap();
        let hold = SeatHold::new(key(), "user-1", now, Duration::seconds(900));
        let encoded = serde_json::to_string(&RedisSlot::from_hold(&hold)).unwrap();

        assert!(!encoded.contains("booking_id"));
        assert_eq!(decode(key(), &encoded).unwrap(), SeatSlot::Held(hold));
    }

    #[test]
    fn test_booked_slot_as_rewritten_by_lua() {
        let booking_id = Uuid::from_u128(99);
        let raw = format!(
            r#"{{"state":"booked","holder":"user-1","booking_id":"{}","created_at_ms":1740810600000}}"#,
            booking_id
        );

        let slot = decode(key(), &raw).unwrap();
        assert_eq!(
            slot,
            SeatSlot::Booked(BookedSeat {
                key: key(),
                booking_id,
                user_id: "user-1".to_string(),
            })
        );
        assert!(decode_hold(key(), &raw).is_err());
    }

    #[test]
    fn test_held_slot_without_expiry_is_rejected() {
        let raw = r#"{"state":"held","holder":"user-1","created_at_ms":1740810600000}"#;
        assert!(decode(key(), raw).is_err());
    }
}
