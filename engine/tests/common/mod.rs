//! Shared fixtures for integration tests.

#![allow(dead_code)]

use serde::{Deserialize, Serialize};
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use stow_engine::{
    DiffResult, Entity, Error, FieldNotifier, GranularRepository, Identity, Key, MemoryTable,
    Repository, Result,
};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LessonRow {
    pub id: Key,
    pub course: Key,
    pub title: String,
}

struct LessonData {
    id: AtomicI64,
    course: AtomicI64,
    title: Mutex<String>,
    changes: FieldNotifier,
}

/// Observable keyed entity; clones are handles to the same lesson.
#[derive(Clone, Serialize, Deserialize)]
#[serde(from = "LessonRow", into = "LessonRow")]
pub struct Lesson(Arc<LessonData>);

impl Lesson {
    pub fn new(id: Key, title: &str) -> Self {
        Self::in_course(id, 0, title)
    }

    pub fn in_course(id: Key, course: Key, title: &str) -> Self {
        Lesson(Arc::new(LessonData {
            id: AtomicI64::new(id),
            course: AtomicI64::new(course),
            title: Mutex::new(title.to_string()),
            changes: FieldNotifier::new(),
        }))
    }

    pub fn title(&self) -> String {
        self.0.title.lock().unwrap().clone()
    }

    pub fn course(&self) -> Key {
        self.0.course.load(Ordering::SeqCst)
    }

    pub fn set_title(&self, title: &str) -> Result<()> {
        *self.0.title.lock().unwrap() = title.to_string();
        self.0.changes.notify("title")
    }

    pub fn set_course(&self, course: Key) -> Result<()> {
        self.0.course.store(course, Ordering::SeqCst);
        self.0.changes.notify("course")
    }

    pub fn listener_count(&self) -> usize {
        self.0.changes.listener_count()
    }
}

impl From<LessonRow> for Lesson {
    fn from(row: LessonRow) -> Self {
        Lesson::in_course(row.id, row.course, &row.title)
    }
}

impl From<Lesson> for LessonRow {
    fn from(lesson: Lesson) -> Self {
        LessonRow {
            id: lesson.key(),
            course: lesson.course(),
            title: lesson.title(),
        }
    }
}

impl PartialEq for Lesson {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl Eq for Lesson {}

impl Hash for Lesson {
    fn hash<H: Hasher>(&self, state: &mut H) {
        (Arc::as_ptr(&self.0) as usize).hash(state);
    }
}

impl std::fmt::Debug for Lesson {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Lesson({}, {}, {:?})", self.key(), self.course(), self.title())
    }
}

impl Entity for Lesson {
    fn notifier(&self) -> Option<&FieldNotifier> {
        Some(&self.0.changes)
    }
}

impl Identity for Lesson {
    fn key(&self) -> Key {
        self.0.id.load(Ordering::SeqCst)
    }

    fn set_key(&self, key: Key) {
        self.0.id.store(key, Ordering::SeqCst);
    }
}

/// Parent of lessons in relationship tests.
#[derive(Debug, Clone)]
pub struct Course {
    pub id: Key,
}

pub fn in_course(course: &Course, lesson: &Lesson) -> bool {
    lesson.course() == course.id
}

/// A granular table whose writes fail while `failing` is set.
#[derive(Default)]
pub struct FlakyRepository {
    pub table: MemoryTable<Lesson>,
    pub failing: AtomicBool,
    pub attempts: AtomicUsize,
}

impl FlakyRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    fn attempt(&self) -> Result<()> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if self.failing.load(Ordering::SeqCst) {
            return Err(Error::backend(std::io::Error::other("connection reset")));
        }
        Ok(())
    }
}

impl Repository<Lesson> for FlakyRepository {
    fn load(&self) -> Result<Vec<Lesson>> {
        self.table.load()
    }

    fn write(&self, items: &[Lesson]) -> Result<()> {
        self.attempt()?;
        self.table.write(items)
    }

    fn clear(&self) -> Result<()> {
        self.attempt()?;
        self.table.clear()
    }
}

impl GranularRepository<Lesson> for FlakyRepository {
    fn insert(&self, item: &Lesson) -> Result<Key> {
        self.attempt()?;
        self.table.insert(item)
    }

    fn update(&self, item: &Lesson) -> Result<usize> {
        self.attempt()?;
        self.table.update(item)
    }

    fn delete(&self, item: &Lesson) -> Result<usize> {
        self.attempt()?;
        self.table.delete(item)
    }

    fn apply_batch(&self, diff: &DiffResult<Lesson>) -> Result<()> {
        self.attempt()?;
        self.table.apply_batch(diff)
    }
}

/// Install a test subscriber once; honours `RUST_LOG`.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
