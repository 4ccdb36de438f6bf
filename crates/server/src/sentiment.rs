use anyhow::{Context, Result};
use common::types::Sentiment;
use rust_decimal::Decimal;

/// One opinion's contribution to an asset's aggregate, in insertion order.
#[derive(Debug, Clone, Copy)]
pub struct OpinionSample {
    pub sentiment: Sentiment,
    pub prediction: Decimal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AssetAggregate {
    pub sentiment: Sentiment,
    pub prediction: Decimal,
}

/// Recompute an asset's displayed aggregate from its full opinion set.
///
/// Sentiment is the most frequent label; a tie keeps whichever tied label
/// was encountered first during the tally, which is deterministic because
/// samples arrive in insertion order. Prediction is the arithmetic mean of
/// all opinion predictions, rounded to two decimal places. An empty set
/// yields the neutral/zero defaults new assets start with.
pub fn aggregate(samples: &[OpinionSample]) -> AssetAggregate {
    if samples.is_empty() {
        return AssetAggregate {
            sentiment: Sentiment::Neutral,
            prediction: Decimal::ZERO,
        };
    }

    let mut tally: Vec<(Sentiment, u32)> = Vec::with_capacity(3);
    let mut sum = Decimal::ZERO;
    for sample in samples {
        match tally.iter_mut().find(|(s, _)| *s == sample.sentiment) {
            Some((_, n)) => *n += 1,
            None => tally.push((sample.sentiment, 1)),
        }
        sum += sample.prediction;
    }

    // Strictly-greater comparison: the first label to reach the winning
    // count wins ties.
    let mut winner = tally[0];
    for &(s, n) in &tally[1..] {
        if n > winner.1 {
            winner = (s, n);
        }
    }

    // Fixed two-decimal scale so the stored string is stable ("12.00", not
    // sometimes "12").
    let mut mean = (sum / Decimal::from(samples.len() as u64)).round_dp(2);
    mean.rescale(2);
    AssetAggregate {
        sentiment: winner.0,
        prediction: mean,
    }
}

/// Load all opinions for `asset_id`, recompute the aggregate, and persist it
/// on the asset row. Meant to run inside the same transaction as an opinion
/// insert so the asset row can never go stale relative to its opinions.
pub fn recompute_asset(conn: &rusqlite::Connection, asset_id: i64) -> Result<AssetAggregate> {
    let mut stmt = conn.prepare(
        "SELECT sentiment, prediction FROM opinions WHERE asset_id = ?1 ORDER BY id ASC",
    )?;
    let raw = stmt
        .query_map([asset_id], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    let mut samples = Vec::with_capacity(raw.len());
    for (sentiment, prediction) in raw {
        let sentiment = Sentiment::from_str_loose(&sentiment)
            .with_context(|| format!("asset {asset_id}: unknown stored sentiment {sentiment:?}"))?;
        let prediction: Decimal = prediction
            .parse()
            .with_context(|| format!("asset {asset_id}: bad stored prediction {prediction:?}"))?;
        samples.push(OpinionSample {
            sentiment,
            prediction,
        });
    }

    let agg = aggregate(&samples);
    conn.execute(
        "UPDATE assets SET sentiment = ?1, prediction = ?2 WHERE id = ?3",
        rusqlite::params![agg.sentiment.as_str(), agg.prediction.to_string(), asset_id],
    )?;
    Ok(agg)
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::db::Database;
    use rust_decimal::Decimal;

    fn sample(sentiment: Sentiment, prediction: &str) -> OpinionSample {
        OpinionSample {
            sentiment,
            prediction: prediction.parse().unwrap(),
        }
    }

    #[test]
    fn test_empty_set_defaults_neutral_zero() {
        let agg = aggregate(&[]);
        assert_eq!(agg.sentiment, Sentiment::Neutral);
        assert_eq!(agg.prediction, Decimal::ZERO);
    }

    #[test]
    fn test_majority_label_wins() {
        let agg = aggregate(&[
            sample(Sentiment::Positive, "10"),
            sample(Sentiment::Negative, "-5"),
            sample(Sentiment::Positive, "20"),
        ]);
        assert_eq!(agg.sentiment, Sentiment::Positive);
    }

    #[test]
    fn test_tie_keeps_first_encountered_label() {
        let agg = aggregate(&[
            sample(Sentiment::Negative, "-10"),
            sample(Sentiment::Positive, "10"),
        ]);
        assert_eq!(agg.sentiment, Sentiment::Negative);

        // Same labels, opposite arrival order.
        let agg = aggregate(&[
            sample(Sentiment::Positive, "10"),
            sample(Sentiment::Negative, "-10"),
        ]);
        assert_eq!(agg.sentiment, Sentiment::Positive);
    }

    #[test]
    fn test_mean_is_exact_decimal() {
        let agg = aggregate(&[
            sample(Sentiment::Positive, "10"),
            sample(Sentiment::Positive, "20"),
            sample(Sentiment::Neutral, "0.5"),
        ]);
        // (10 + 20 + 0.5) / 3 = 10.166... -> 10.17
        assert_eq!(agg.prediction.to_string(), "10.17");
    }

    #[test]
    fn test_mean_handles_negative_predictions() {
        let agg = aggregate(&[
            sample(Sentiment::Negative, "-100"),
            sample(Sentiment::Positive, "1000"),
        ]);
        assert_eq!(agg.prediction.to_string(), "450.00");
    }

    #[test]
    fn test_recompute_asset_persists_aggregate() {
        let db = Database::open(":memory:").unwrap();
        db.run_migrations().unwrap();
        db.conn
            .execute(
                "INSERT INTO users (username, password_hash) VALUES ('alice', 'x')",
                [],
            )
            .unwrap();
        db.conn
            .execute(
                "INSERT INTO assets (symbol, name, category) VALUES ('BTC', 'Bitcoin', 'crypto')",
                [],
            )
            .unwrap();
        for (sentiment, prediction) in [("positive", "30"), ("positive", "10"), ("negative", "-4")]
        {
            db.conn
                .execute(
                    "INSERT INTO opinions (user_id, asset_id, username, sentiment, prediction)
                     VALUES (1, 1, 'alice', ?1, ?2)",
                    rusqlite::params![sentiment, prediction],
                )
                .unwrap();
        }

        let agg = recompute_asset(&db.conn, 1).unwrap();
        assert_eq!(agg.sentiment, Sentiment::Positive);
        assert_eq!(agg.prediction.to_string(), "12.00");

        let (stored_sentiment, stored_prediction): (String, String) = db
            .conn
            .query_row(
                "SELECT sentiment, prediction FROM assets WHERE id = 1",
                [],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .unwrap();
        assert_eq!(stored_sentiment, "positive");
        assert_eq!(stored_prediction, "12.00");
    }

    #[test]
    fn test_recompute_asset_with_no_opinions_resets_defaults() {
        let db = Database::open(":memory:").unwrap();
        db.run_migrations().unwrap();
        db.conn
            .execute(
                "INSERT INTO assets (symbol, name, category, sentiment, prediction)
                 VALUES ('ETH', 'Ethereum', 'crypto', 'positive', '42')",
                [],
            )
            .unwrap();

        let agg = recompute_asset(&db.conn, 1).unwrap();
        assert_eq!(agg.sentiment, Sentiment::Neutral);
        assert_eq!(agg.prediction, Decimal::ZERO);
    }
}
