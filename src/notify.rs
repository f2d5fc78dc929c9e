//! Hand-off of reported events to the chat notifier.
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{FixedOffset, TimeZone};
use teloxide::prelude::*;
use teloxide::types::ParseMode;
use teloxide::utils::html::escape;
use tracing::{debug, info, instrument, warn};

use crate::config::Config;
use crate::db::{self, Pool};
use crate::model::ReportedEvent;
use crate::sync::{self, SyncCycle};

/// Delivers one formatted message.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send(&self, text: &str) -> Result<()>;
}

pub struct TelegramNotifier {
    bot: Bot,
    chat_id: ChatId,
}

impl TelegramNotifier {
    pub fn new(bot_token: &str, chat_id: i64) -> Self {
        Self {
            bot: Bot::new(bot_token),
            chat_id: ChatId(chat_id),
        }
    }

    pub fn from_config(cfg: &Config) -> Self {
        Self::new(&cfg.telegram.bot_token, cfg.telegram.chat_id)
    }
}

#[async_trait]
impl Notifier for TelegramNotifier {
    async fn send(&self, text: &str) -> Result<()> {
        self.bot
            .send_message(self.chat_id, text)
            .parse_mode(ParseMode::Html)
            .disable_web_page_preview(true)
            .await
            .context("telegram send_message failed")?;
        Ok(())
    }
}

/// HTML message for one event; times are rendered at `offset`.
pub fn format_notice(event: &ReportedEvent, offset: FixedOffset) -> String {
    let header = if event.updated {
        "🔄 <b>Concert updated</b>"
    } else {
        "🎸 <b>New concert</b>"
    };
    let mut text = format!("{}\n\n<b>{}</b>\n", header, escape(&event.title));

    let first = event.dates.iter().min_by_key(|d| d.start);
    match first.and_then(|d| offset.timestamp_opt(d.start, 0).single()) {
        Some(start) => {
            text.push_str(&format!("📅 {}", start.format("%d.%m.%Y %H:%M")));
            if event.dates.len() > 1 {
                text.push_str(&format!(" (+{} more)", event.dates.len() - 1));
            }
            text.push('\n');
        }
        None => text.push_str("📅 date to be announced\n"),
    }

    if let Some(place) = &event.place {
        text.push_str(&format!(
            "📍 {} ({})\n",
            escape(&place.title),
            escape(&place.address)
        ));
    }

    if event.price.trim().is_empty() {
        text.push_str("🎟 price not announced");
    } else {
        text.push_str(&format!("🎟 {}", escape(&event.price)));
    }
    text
}

/// Send each event and mark it sent on success. Failed sends stay unsent and
/// are picked up again by the next backlog delivery. Returns how many were
/// delivered.
#[instrument(skip_all, fields(events = events.len()))]
pub async fn deliver(
    pool: &Pool,
    notifier: &dyn Notifier,
    events: &[ReportedEvent],
    offset: FixedOffset,
) -> Result<usize> {
    let mut delivered = 0;
    for event in events {
        let text = format_notice(event, offset);
        match notifier.send(&text).await {
            Ok(()) => {
                db::mark_event_sent(pool, event.event_id).await?;
                delivered += 1;
            }
            Err(err) => {
                warn!(?err, event_id = event.event_id, "notification failed; left unsent");
            }
        }
    }
    info!(delivered, "notifications delivered");
    Ok(delivered)
}

/// Deliver everything still flagged unsent in the store.
pub async fn deliver_backlog(
    pool: &Pool,
    notifier: &dyn Notifier,
    offset: FixedOffset,
) -> Result<usize> {
    let pending = db::unsent_events(pool).await?;
    if pending.is_empty() {
        return Ok(0);
    }
    info!(pending = pending.len(), "delivering unsent backlog");
    deliver(pool, notifier, &pending, offset).await
}

/// One scheduled events tick: run the cycle, then deliver everything still
/// unsent. The backlog covers this run's events and any earlier failed sends,
/// and is delivered even when the cycle itself aborted.
pub async fn run_events_tick<C>(
    cycle: &C,
    notifier: &dyn Notifier,
    offset: FixedOffset,
) -> Result<usize>
where
    C: SyncCycle<Record = ReportedEvent> + ?Sized,
{
    if let Some(report) = sync::run_cycle(cycle).await {
        debug!(reported = report.reported.len(), "events cycle reported");
    }
    deliver_backlog(cycle.pool(), notifier, offset).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{DateRange, Place};

    fn moscow() -> FixedOffset {
        FixedOffset::east_opt(3 * 3600).unwrap()
    }

    fn event() -> ReportedEvent {
        ReportedEvent {
            event_id: 7,
            title: "Korn <live>".into(),
            slug: "korn".into(),
            price: "от 2500 до 9000 рублей".into(),
            place: Some(Place {
                id: 1,
                title: "Arena & Co".into(),
                address: "Main st. 1".into(),
            }),
            dates: vec![
                DateRange { start: 86_400, end: 90_000 },
                DateRange { start: 0, end: 3_600 },
            ],
            updated: false,
        }
    }

    #[test]
    fn notice_lists_earliest_local_date_place_and_price() {
        let text = format_notice(&event(), moscow());
        assert!(text.starts_with("🎸 <b>New concert</b>"));
        assert!(text.contains("<b>Korn &lt;live&gt;</b>"));
        assert!(text.contains("📅 01.01.1970 03:00 (+1 more)"));
        assert!(text.contains("📍 Arena &amp; Co (Main st. 1)"));
        assert!(text.contains("🎟 от 2500 до 9000 рублей"));
    }

    #[test]
    fn updated_notice_and_missing_fields() {
        let mut e = event();
        e.updated = true;
        e.place = None;
        e.dates.clear();
        e.price = " ".into();
        let text = format_notice(&e, moscow());
        assert!(text.starts_with("🔄 <b>Concert updated</b>"));
        assert!(text.contains("date to be announced"));
        assert!(!text.contains("📍"));
        assert!(text.ends_with("price not announced"));
    }
}
