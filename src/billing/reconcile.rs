//! Subscription state machine driven by provider events.
//!
//! Extraction (`transition_for`) and state computation (`next_state`) are
//! pure. `SubscriptionStateStore::upsert_from_event` does the I/O.

use super::error::BillingError;
use super::storage::{Subscription, SubscriptionStatus};
use super::tiers::{BillingInterval, PriceTable, Tier};
use chrono::{DateTime, Months, Utc};
use serde::Deserialize;
use serde_json::Value;

const SECONDS_PER_DAY: i64 = 86_400;

/// Provider event envelope.
#[derive(Debug, Clone, Deserialize)]
pub struct ProviderEvent {
    pub id: String,
    #[serde(rename = "type")]
    pub event_type: String,
    /// Unix seconds; the event's ordering marker.
    pub created: i64,
    pub data: EventData,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EventData {
    pub object: Value,
}

/// Which subscription row an event addresses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    Subject(String),
    Provider {
        subscription_id: Option<String>,
        customer_id: Option<String>,
        subject_hint: Option<String>,
    },
}

/// Period bounds in unix seconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Period {
    pub start: i64,
    pub end: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Change {
    Activate {
        tier: Tier,
        trialing: bool,
        period: Period,
        customer_id: Option<String>,
        subscription_id: Option<String>,
    },
    Update {
        tier: Option<Tier>,
        status: SubscriptionStatus,
        period: Option<Period>,
        cancel_at_period_end: bool,
    },
    Cancel,
    PaymentFailed,
    PaymentSucceeded,
}

/// A state change requested by one event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    pub target: Target,
    pub change: Change,
}

impl Transition {
    fn subscription_id(&self) -> Option<&str> {
        match &self.target {
            Target::Provider {
                subscription_id, ..
            } => subscription_id.as_deref(),
            Target::Subject(_) => None,
        }
    }
}

/// What to do with the stored row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    /// Write the new row.
    Write(Subscription),
    /// Precondition not met. Only the ordering marker advances.
    Observe { next: Subscription, reason: String },
    /// The row already reflects this event.
    Unchanged,
    /// Precondition not met and nothing to write.
    Skip(String),
    /// Older than the newest applied event.
    Stale,
}

/// Map an event to a transition. `Ok(None)` for event types this crate ignores.
pub fn transition_for(
    event: &ProviderEvent,
    prices: &PriceTable,
) -> Result<Option<Transition>, BillingError> {
    let object = &event.data.object;
    let transition = match event.event_type.as_str() {
        "checkout.session.completed" => Some(checkout_completed(object, event.created)?),
        "customer.subscription.updated" => Some(Transition {
            target: provider_target(object, "id"),
            change: subscription_updated(object, prices)?,
        }),
        "customer.subscription.deleted" => Some(Transition {
            target: provider_target(object, "id"),
            change: Change::Cancel,
        }),
        "invoice.payment_failed" => Some(Transition {
            target: provider_target(object, "subscription"),
            change: Change::PaymentFailed,
        }),
        "invoice.payment_succeeded" | "invoice.paid" => Some(Transition {
            target: provider_target(object, "subscription"),
            change: Change::PaymentSucceeded,
        }),
        _ => None,
    };

    if let Some(Transition {
        target: Target::Provider {
            subscription_id: None,
            customer_id: None,
            subject_hint: None,
        },
        ..
    }) = &transition
    {
        return Err(payload_error("event names no subscription, customer or subject"));
    }
    Ok(transition)
}

fn checkout_completed(object: &Value, created: i64) -> Result<Transition, BillingError> {
    let subject_id = str_field(object, "client_reference_id")
        .or_else(|| metadata(object, "subject_id"))
        .ok_or_else(|| payload_error("checkout session has no subject"))?;

    let tier: Tier = metadata(object, "tier")
        .ok_or_else(|| payload_error("checkout session has no tier"))?
        .parse()
        .map_err(|e: BillingError| payload_error(&e.to_string()))?;

    let interval = match metadata(object, "interval") {
        Some(raw) => raw
            .parse()
            .map_err(|e: BillingError| payload_error(&e.to_string()))?,
        None => BillingInterval::Month,
    };

    let trial_days = metadata(object, "trial_days")
        .and_then(|raw| raw.parse::<i64>().ok())
        .filter(|days| *days > 0);

    let end = match trial_days {
        Some(days) => created + days * SECONDS_PER_DAY,
        None => add_months(created, interval.months()),
    };

    Ok(Transition {
        target: Target::Subject(subject_id),
        change: Change::Activate {
            tier,
            trialing: trial_days.is_some(),
            period: Period {
                start: created,
                end,
            },
            customer_id: str_field(object, "customer"),
            subscription_id: str_field(object, "subscription"),
        },
    })
}

fn subscription_updated(object: &Value, prices: &PriceTable) -> Result<Change, BillingError> {
    let status = object
        .get("status")
        .and_then(Value::as_str)
        .map(SubscriptionStatus::from_provider)
        .ok_or_else(|| payload_error("subscription has no status"))?;

    let tier = match metadata(object, "tier") {
        Some(raw) => Some(
            raw.parse::<Tier>()
                .map_err(|e| payload_error(&e.to_string()))?,
        ),
        None => first_price_id(object).and_then(|price| prices.tier_for_price(&price)),
    };

    let period = match (
        period_field(object, "current_period_start"),
        period_field(object, "current_period_end"),
    ) {
        (Some(start), Some(end)) => Some(Period { start, end }),
        _ => None,
    };

    Ok(Change::Update {
        tier,
        status,
        period,
        cancel_at_period_end: object
            .get("cancel_at_period_end")
            .and_then(Value::as_bool)
            .unwrap_or(false),
    })
}

fn provider_target(object: &Value, subscription_key: &str) -> Target {
    Target::Provider {
        subscription_id: str_field(object, subscription_key),
        customer_id: str_field(object, "customer"),
        subject_hint: metadata(object, "subject_id"),
    }
}

/// Compute the row that results from applying `transition` to `current`.
pub fn next_state(
    subject_id: &str,
    current: Option<&Subscription>,
    transition: &Transition,
    event_at: i64,
    now: i64,
) -> Decision {
    if let Some(current) = current {
        if event_at < current.last_event_at {
            return Decision::Stale;
        }
        if !matches!(transition.change, Change::Activate { .. }) {
            if let (Some(event_sub), Some(stored_sub)) = (
                transition.subscription_id(),
                current.provider_subscription_id.as_deref(),
            ) {
                if event_sub != stored_sub {
                    return Decision::Skip(format!(
                        "event is for subscription {event_sub}, stored row tracks {stored_sub}"
                    ));
                }
            }
        }
    }

    let next = match (&transition.change, current) {
        (
            Change::Activate {
                tier,
                trialing,
                period,
                customer_id,
                subscription_id,
            },
            _,
        ) => {
            if let Some(current) = current {
                let same_subscription = subscription_id.is_some()
                    && current.provider_subscription_id == *subscription_id;
                if current.status.is_entitled() && !same_subscription {
                    return Decision::Skip(
                        "subject already has an active subscription".to_string(),
                    );
                }
            }
            Subscription {
                subject_id: subject_id.to_string(),
                tier: *tier,
                status: if *trialing {
                    SubscriptionStatus::Trialing
                } else {
                    SubscriptionStatus::Active
                },
                provider_customer_id: customer_id
                    .clone()
                    .or_else(|| current.and_then(|c| c.provider_customer_id.clone())),
                provider_subscription_id: subscription_id.clone(),
                current_period_start: period.start,
                current_period_end: period.end,
                cancel_at_period_end: false,
                last_event_at: event_at,
                version: 0,
                updated_at: now,
            }
        }
        (_, None) => return Decision::Skip("no subscription for event".to_string()),
        (
            Change::Update {
                tier,
                status,
                period,
                cancel_at_period_end,
            },
            Some(current),
        ) => {
            let mut next = current.clone();
            if let Some(tier) = tier {
                next.tier = *tier;
            }
            next.status = *status;
            if let Some(period) = period {
                next.current_period_start = period.start;
                next.current_period_end = period.end;
            }
            next.cancel_at_period_end = *cancel_at_period_end;
            next
        }
        (Change::Cancel, Some(current)) => {
            let mut next = current.clone();
            next.status = SubscriptionStatus::Canceled;
            next.cancel_at_period_end = false;
            next
        }
        (Change::PaymentFailed, Some(current)) => {
            if current.is_canceled() {
                return observe(current, event_at, now, "subscription is canceled");
            }
            let mut next = current.clone();
            next.status = SubscriptionStatus::PastDue;
            next
        }
        (Change::PaymentSucceeded, Some(current)) => {
            if current.status != SubscriptionStatus::PastDue {
                return observe(current, event_at, now, "subscription is not past due");
            }
            let mut next = current.clone();
            next.status = SubscriptionStatus::Active;
            next
        }
    };

    finish(current, next, event_at, now)
}

fn finish(current: Option<&Subscription>, mut next: Subscription, event_at: i64, now: i64) -> Decision {
    next.last_event_at = current.map_or(event_at, |c| c.last_event_at.max(event_at));
    next.version = current.map_or(1, |c| c.version + 1);
    next.updated_at = now;

    match current {
        Some(current) if same_state(current, &next) => Decision::Unchanged,
        _ => Decision::Write(next),
    }
}

fn observe(current: &Subscription, event_at: i64, now: i64, reason: &str) -> Decision {
    if event_at <= current.last_event_at {
        return Decision::Skip(reason.to_string());
    }
    let mut next = current.clone();
    next.last_event_at = event_at;
    next.version = current.version + 1;
    next.updated_at = now;
    Decision::Observe {
        next,
        reason: reason.to_string(),
    }
}

/// Equal ignoring `version` and `updated_at`.
fn same_state(a: &Subscription, b: &Subscription) -> bool {
    a.subject_id == b.subject_id
        && a.tier == b.tier
        && a.status == b.status
        && a.provider_customer_id == b.provider_customer_id
        && a.provider_subscription_id == b.provider_subscription_id
        && a.current_period_start == b.current_period_start
        && a.current_period_end == b.current_period_end
        && a.cancel_at_period_end == b.cancel_at_period_end
        && a.last_event_at == b.last_event_at
}

fn add_months(start: i64, months: u32) -> i64 {
    DateTime::<Utc>::from_timestamp(start, 0)
        .and_then(|dt| dt.checked_add_months(Months::new(months)))
        .map(|dt| dt.timestamp())
        .unwrap_or(start + i64::from(months) * 30 * SECONDS_PER_DAY)
}

fn payload_error(message: &str) -> BillingError {
    BillingError::InvalidWebhookPayload {
        message: message.to_string(),
    }
}

/// String field, or the `id` of an expanded object.
fn str_field(object: &Value, key: &str) -> Option<String> {
    match object.get(key)? {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Object(map) => map.get("id").and_then(Value::as_str).map(str::to_string),
        _ => None,
    }
}

/// Metadata values arrive as strings, but numbers are accepted too.
fn metadata(object: &Value, key: &str) -> Option<String> {
    match object.get("metadata")?.get(key)? {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Period fields live on the object or on its first item.
fn period_field(object: &Value, key: &str) -> Option<i64> {
    object.get(key).and_then(Value::as_i64).or_else(|| {
        object
            .pointer("/items/data/0")
            .and_then(|item| item.get(key))
            .and_then(Value::as_i64)
    })
}

fn first_price_id(object: &Value) -> Option<String> {
    object
        .pointer("/items/data/0/price/id")
        .and_then(Value::as_str)
        .map(str::to_string)
}
