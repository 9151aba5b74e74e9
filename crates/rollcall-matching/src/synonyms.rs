//! First-name synonym table.
//!
//! Names in one group are interchangeable ("Bill" and "William"). A name
//! may appear in several groups; two names are synonyms when they share at
//! least one.

use std::collections::{HashMap, HashSet};

const DEFAULT_GROUPS: &[&[&str]] = &[
    &["william", "bill", "billy", "will", "willie", "liam"],
    &["robert", "bob", "bobby", "rob", "robbie", "bert"],
    &["elizabeth", "liz", "lizzie", "beth", "betty", "eliza", "libby", "elspeth"],
    &["margaret", "maggie", "meg", "peggy", "marge", "greta"],
    &["richard", "rick", "ricky", "dick", "rich", "richie"],
    &["james", "jim", "jimmy", "jamie"],
    &["john", "jack", "johnny", "jon"],
    &["katherine", "catherine", "kathryn", "kate", "katie", "kathy", "cathy", "kat"],
    &["michael", "mike", "mick", "mickey"],
    &["edward", "ed", "eddie", "ted", "teddy", "ned"],
    &["alexander", "alex", "alec", "sandy", "xander"],
    &["alexandra", "alex", "sandra", "sasha", "lexi"],
    &["christopher", "chris", "kit"],
    &["christine", "chris", "chrissie", "tina"],
    &["thomas", "tom", "tommy"],
    &["anthony", "tony", "ant"],
    &["patricia", "pat", "patty", "trish"],
    &["patrick", "pat", "paddy"],
    &["daniel", "dan", "danny"],
    &["david", "dave", "davy"],
    &["joseph", "joe", "joey"],
    &["susan", "sue", "susie", "suzanne"],
    &["jennifer", "jen", "jenny"],
    &["rebecca", "becky", "becca"],
    &["samuel", "sam", "sammy"],
    &["samantha", "sam", "sammie"],
    &["nicholas", "nick", "nicky"],
    &["deborah", "debbie", "deb", "debra"],
    &["stephen", "steven", "steve", "stevie"],
    &["victoria", "vicky", "tori"],
];

#[derive(Debug, Clone)]
pub struct NameSynonyms {
    /// Lower-cased name to the ids of the groups it belongs to.
    groups: HashMap<String, HashSet<usize>>,
    next_group: usize,
}

impl Default for NameSynonyms {
    fn default() -> Self {
        let mut table = Self::empty();
        for group in DEFAULT_GROUPS {
            table.add_group(group.iter().copied());
        }
        table
    }
}

impl NameSynonyms {
    pub fn empty() -> Self {
        Self {
            groups: HashMap::new(),
            next_group: 0,
        }
    }

    pub fn add_group<I, S>(&mut self, names: I)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let id = self.next_group;
        self.next_group += 1;
        for name in names {
            self.groups
                .entry(normalize(name.as_ref()))
                .or_default()
                .insert(id);
        }
    }

    #[must_use]
    pub fn with_group<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.add_group(names);
        self
    }

    /// True for the same name too, ignoring case and surrounding space.
    pub fn are_synonyms(&self, a: &str, b: &str) -> bool {
        let (a, b) = (normalize(a), normalize(b));
        if a == b {
            return true;
        }
        match (self.groups.get(&a), self.groups.get(&b)) {
            (Some(x), Some(y)) => !x.is_disjoint(y),
            _ => false,
        }
    }

    pub fn len(&self) -> usize {
        self.next_group
    }

    pub fn is_empty(&self) -> bool {
        self.next_group == 0
    }
}

fn normalize(name: &str) -> String {
    name.trim().to_lowercase()
}
