//! Test fixtures shared by unit tests.

use crate::{lock, Entity, FieldNotifier, Identity, Key, Result};
use serde::{Deserialize, Serialize};
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};

/// Plain row form of a [`Card`], used for serialization.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CardRow {
    pub id: Key,
    pub deck: Key,
    pub title: String,
}

struct CardData {
    id: AtomicI64,
    deck: AtomicI64,
    title: Mutex<String>,
    changes: FieldNotifier,
}

/// A shared, observable, identity-bearing entity. Equality is by reference.
#[derive(Clone, Serialize, Deserialize)]
#[serde(from = "CardRow", into = "CardRow")]
pub struct Card(Arc<CardData>);

impl Card {
    pub fn new(id: Key, title: &str) -> Self {
        Self::in_deck(id, 0, title)
    }

    pub fn in_deck(id: Key, deck: Key, title: &str) -> Self {
        Card(Arc::new(CardData {
            id: AtomicI64::new(id),
            deck: AtomicI64::new(deck),
            title: Mutex::new(title.to_string()),
            changes: FieldNotifier::new(),
        }))
    }

    pub fn title(&self) -> String {
        lock(&self.0.title).clone()
    }

    pub fn deck(&self) -> Key {
        self.0.deck.load(Ordering::SeqCst)
    }

    pub fn set_title(&self, title: &str) -> Result<()> {
        *lock(&self.0.title) = title.to_string();
        self.0.changes.notify("title")
    }

    pub fn set_deck(&self, deck: Key) -> Result<()> {
        self.0.deck.store(deck, Ordering::SeqCst);
        self.0.changes.notify("deck")
    }

    pub fn listener_count(&self) -> usize {
        self.0.changes.listener_count()
    }

    pub fn row(&self) -> CardRow {
        CardRow::from(self.clone())
    }
}

impl From<CardRow> for Card {
    fn from(row: CardRow) -> Self {
        Card::in_deck(row.id, row.deck, &row.title)
    }
}

impl From<Card> for CardRow {
    fn from(card: Card) -> Self {
        CardRow {
            id: card.key(),
            deck: card.deck(),
            title: card.title(),
        }
    }
}

impl PartialEq for Card {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl Eq for Card {}

impl Hash for Card {
    fn hash<H: Hasher>(&self, state: &mut H) {
        (Arc::as_ptr(&self.0) as usize).hash(state);
    }
}

impl std::fmt::Debug for Card {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Card({}, {:?})", self.key(), self.title())
    }
}

impl Entity for Card {
    fn notifier(&self) -> Option<&FieldNotifier> {
        Some(&self.0.changes)
    }
}

impl Identity for Card {
    fn key(&self) -> Key {
        self.0.id.load(Ordering::SeqCst)
    }

    fn set_key(&self, key: Key) {
        self.0.id.store(key, Ordering::SeqCst);
    }
}
