//! The recipe registry: ordered recipes indexed by canonical key or tracked
//! as a predicate list, layered into a stack of scopes for temporary
//! overrides. Lookups run in parallel under a read lock; mutations are
//! serialized by the write lock.

use crate::{
    http::{InterceptedRequest, SynthesizedResponse},
    recipe::{CanonicalKey, Recipe, RecipeId},
};
use indexmap::IndexMap;
use std::sync::{Arc, RwLock};
use tracing::{debug, trace};

/// Fallback producer consulted when no recipe matches. Returning `None`
/// abstains, letting strict/permissive handling take over.
pub type FallbackProducer =
    Arc<dyn Fn(&InterceptedRequest) -> Option<SynthesizedResponse> + Send + Sync>;

/// Mutator applied to every synthesized response after synthesis
pub type ResponseMutator =
    Arc<dyn Fn(&mut SynthesizedResponse) + Send + Sync>;

/// Handle identifying an open scope. [Registry::end_scope] checks handles
/// match LIFO order; anything else is a programming error in the test.
#[derive(Copy, Clone, Debug, Eq, Hash, PartialEq)]
pub struct ScopeHandle(u64);

/// One layer of the scope stack
struct Scope {
    handle: ScopeHandle,
    /// Fluent-built recipes, addressable by canonical key. At most one
    /// active recipe per key per layer: re-registration replaces.
    keyed: IndexMap<CanonicalKey, Arc<Recipe>>,
    /// Predicate-style recipes in registration order
    predicates: Vec<Arc<Recipe>>,
}

impl Scope {
    fn new(handle: ScopeHandle) -> Self {
        Self {
            handle,
            keyed: IndexMap::new(),
            predicates: Vec::new(),
        }
    }
}

struct RegistryState {
    /// Bottom entry is the base scope, which is never popped
    scopes: Vec<Scope>,
    next_handle: u64,
    /// Fail with `Unmatched` instead of returning the sentinel empty 200
    strict: bool,
    on_unmatched: Option<FallbackProducer>,
    mutators: Vec<ResponseMutator>,
}

/// Holds registered recipes and decides which one serves a request. Created
/// empty, mutated by registrations and scopes, dropped with the test
/// fixture. Thread-safe; share it via `Arc` between the hook and the test
/// body.
pub struct Registry {
    state: RwLock<RegistryState>,
}

impl Registry {
    pub fn new() -> Self {
        Self {
            state: RwLock::new(RegistryState {
                scopes: vec![Scope::new(ScopeHandle(0))],
                next_handle: 1,
                strict: false,
                on_unmatched: None,
                mutators: Vec::new(),
            }),
        }
    }

    /// Install a recipe in the current (top) scope. A keyed recipe replaces
    /// any recipe already registered at the same canonical key in that
    /// scope; a predicate recipe appends to the scope's predicate list.
    pub fn register(&self, recipe: Arc<Recipe>) {
        let mut state = self.write();
        let scope = state.scopes.last_mut().expect("scope stack is empty");
        debug!(
            recipe_id = %recipe.id(),
            keyed = recipe.key().is_some(),
            scope = ?scope.handle,
            "Registering recipe"
        );
        match recipe.key() {
            Some(key) => {
                scope.keyed.insert(key.clone(), recipe);
            }
            None => scope.predicates.push(recipe),
        }
    }

    /// Remove the recipe at a canonical key from the current scope. Lower
    /// scopes are unaffected; a shadowed recipe becomes visible again only
    /// when its own scope ends.
    pub fn deregister(&self, key: &CanonicalKey) -> Option<Arc<Recipe>> {
        let mut state = self.write();
        let scope = state.scopes.last_mut().expect("scope stack is empty");
        scope.keyed.shift_remove(key)
    }

    /// Remove a recipe from the current scope by ID, whichever list it is in
    pub fn deregister_recipe(&self, id: RecipeId) -> bool {
        let mut state = self.write();
        let scope = state.scopes.last_mut().expect("scope stack is empty");
        let keyed_before = scope.keyed.len();
        scope.keyed.retain(|_, recipe| recipe.id() != id);
        let predicates_before = scope.predicates.len();
        scope.predicates.retain(|recipe| recipe.id() != id);
        keyed_before != scope.keyed.len()
            || predicates_before != scope.predicates.len()
    }

    /// Push a new scope layer. Registrations target it until it ends;
    /// lookups still see lower layers where the new one has no match.
    pub fn begin_scope(&self) -> ScopeHandle {
        let mut state = self.write();
        let handle = ScopeHandle(state.next_handle);
        state.next_handle += 1;
        state.scopes.push(Scope::new(handle));
        debug!(scope = ?handle, "Began registry scope");
        handle
    }

    /// Pop the current scope, discarding its registrations and overrides.
    /// Scopes are LIFO; panics if `handle` is not the top scope. Scopes are
    /// global to the registry, not thread-local: ending a scope from a
    /// different logical context than opened it is a bug in the test.
    pub fn end_scope(&self, handle: ScopeHandle) {
        let mut state = self.write();
        assert!(
            state.scopes.len() > 1,
            "end_scope({handle:?}) called with no scope open"
        );
        let top = state.scopes.last().expect("scope stack is empty").handle;
        assert!(
            top == handle,
            "end_scope called out of order: top scope is {top:?}, \
            got {handle:?}"
        );
        state.scopes.pop();
        debug!(scope = ?handle, "Ended registry scope");
    }

    /// Select the recipe serving this request, or `None` for a miss.
    ///
    /// Keyed recipes win over predicate recipes. For keyed recipes the
    /// topmost scope containing a match wins, in registration order within a
    /// layer. For predicate recipes, the accepting candidate with the
    /// highest priority wins, ties broken by most recent registration
    /// (topmost scope, then latest append). A matching single-use recipe is
    /// claimed here, atomically, so it dispatches at most once even under
    /// concurrent lookups.
    pub fn lookup(
        &self,
        request: &InterceptedRequest,
    ) -> Option<Arc<Recipe>> {
        let state = self.read();

        for scope in state.scopes.iter().rev() {
            for recipe in scope.keyed.values() {
                if recipe.is_consumed() || !recipe.matches(request) {
                    continue;
                }
                if recipe.try_claim() {
                    trace!(
                        recipe_id = %recipe.id(),
                        scope = ?scope.handle,
                        "Matched keyed recipe"
                    );
                    return Some(Arc::clone(recipe));
                }
            }
        }

        // Rescan on a lost claim race: the loser permanently consumed the
        // recipe, so the loop strictly shrinks the candidate set
        loop {
            let mut best: Option<&Arc<Recipe>> = None;
            for scope in state.scopes.iter().rev() {
                for recipe in scope.predicates.iter().rev() {
                    if recipe.is_consumed() || !recipe.matches(request) {
                        continue;
                    }
                    // Iteration is most-recent-first, so only a strictly
                    // higher priority displaces the current best
                    if best.is_none_or(|b| recipe.priority() > b.priority()) {
                        best = Some(recipe);
                    }
                }
            }
            let recipe = best?;
            if recipe.try_claim() {
                trace!(recipe_id = %recipe.id(), "Matched predicate recipe");
                return Some(Arc::clone(recipe));
            }
        }
    }

    /// Drop a consumed single-use recipe from whichever scope layer holds it
    pub(crate) fn remove_consumed(&self, id: RecipeId) {
        let mut state = self.write();
        for scope in &mut state.scopes {
            scope.keyed.retain(|_, recipe| recipe.id() != id);
            scope.predicates.retain(|recipe| recipe.id() != id);
        }
    }

    /// In strict mode an unmatched request is a dispatch failure; in
    /// permissive mode (the default) it gets an empty 200
    pub fn set_strict(&self, strict: bool) {
        self.write().strict = strict;
    }

    pub fn is_strict(&self) -> bool {
        self.read().strict
    }

    /// Install a fallback producer consulted when no recipe matches. It may
    /// return a response or abstain with `None`.
    pub fn on_unmatched(
        &self,
        fallback: impl Fn(&InterceptedRequest) -> Option<SynthesizedResponse>
        + Send
        + Sync
        + 'static,
    ) {
        self.write().on_unmatched = Some(Arc::new(fallback));
    }

    /// Apply a mutator to every response synthesized from a recipe, after
    /// synthesis
    pub fn mutate_responses(
        &self,
        mutator: impl Fn(&mut SynthesizedResponse) + Send + Sync + 'static,
    ) {
        self.write().mutators.push(Arc::new(mutator));
    }

    /// Run the fallback producer for an unmatched request, if one is set
    pub(crate) fn fallback(
        &self,
        request: &InterceptedRequest,
    ) -> Option<SynthesizedResponse> {
        // Clone the producer out so the user callback runs unlocked
        let fallback = self.read().on_unmatched.clone()?;
        fallback(request)
    }

    pub(crate) fn apply_mutators(&self, response: &mut SynthesizedResponse) {
        let mutators = self.read().mutators.clone();
        for mutator in mutators {
            mutator(response);
        }
    }

    /// Total recipes across all scopes, for diagnostics
    pub fn recipe_count(&self) -> usize {
        self.read()
            .scopes
            .iter()
            .map(|scope| scope.keyed.len() + scope.predicates.len())
            .sum()
    }

    /// Drop every registration in the current scope
    pub fn clear(&self) {
        let mut state = self.write();
        let scope = state.scopes.last_mut().expect("scope stack is empty");
        scope.keyed.clear();
        scope.predicates.clear();
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, RegistryState> {
        self.state.read().expect("registry lock poisoned")
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, RegistryState> {
        self.state.write().expect("registry lock poisoned")
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}
