//! Bring devices in line with a list of desired bindings.
//!
//! Each binding is evaluated to a no-op, a bind or an unbind and processed to
//! completion before the next. Per-binding errors are recorded and the run
//! goes on, except for fatal ones: those leave a device in an unknown state
//! and stop the run.

use crate::binding::{Binding, BindingState};
use crate::error::{ClevisError, Result};
use crate::host::Host;
use crate::luks::{
    DeviceInspector, KeyslotManager, LuksMetadata, MetadataFormat, MetadataTransaction,
    PassphraseChange,
};
use crate::policy::{build_policy, configs_equivalent, decode_policy, jwe, Policy};
use crate::secret::{Credential, Secret};
use either::Either;

pub mod report;

pub use report::{Action, Outcome, Report, Summary};

/// How to put a keyslot back if the metadata write after it fails.
enum KeyslotUndo {
    /// The slot was empty.
    Kill,
    /// Change the slot back to this.
    Restore(Credential),
    /// The previous secret is not known.
    Unavailable,
}

/// Everything a bind works from, resolved up front.
struct BindRequest<'b> {
    binding: &'b Binding,
    metadata: LuksMetadata,
    policy: Policy,
}

impl BindRequest<'_> {
    fn device(&self) -> &str {
        &self.binding.device
    }

    fn slot(&self) -> u32 {
        self.binding.slot
    }
}

pub struct Reconciler<'h> {
    host: &'h dyn Host,
    dry_run: bool,
}

impl<'h> Reconciler<'h> {
    pub fn new(host: &'h dyn Host) -> Self {
        Self {
            host,
            dry_run: false,
        }
    }

    /// Evaluate only: report what would change without touching any device.
    pub fn dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    fn inspector(&self) -> DeviceInspector<'h> {
        DeviceInspector::new(self.host)
    }

    fn keyslots(&self) -> KeyslotManager<'h> {
        KeyslotManager::new(self.host)
    }

    pub fn reconcile(&self, bindings: &[Binding]) -> Report {
        let mut report = Report::default();
        for binding in bindings {
            let result = self.apply(binding);
            match &result {
                Ok(action) => log::info!("{}:{}: {:?}", binding.device, binding.slot, action),
                Err(e) => log::error!("{}:{}: {}", binding.device, binding.slot, e),
            }
            let fatal = matches!(&result, Err(e) if e.is_fatal());
            report.record(Outcome::new(binding, result));
            if fatal {
                log::error!("aborting after fatal error on {}", binding.device);
                report.aborted = true;
                break;
            }
        }
        report
    }

    pub fn apply(&self, binding: &Binding) -> Result<Action> {
        match binding.state {
            BindingState::Present => self.bind(binding),
            BindingState::Absent => self.unbind(binding),
        }
    }

    fn bind(&self, binding: &Binding) -> Result<Action> {
        let (device, slot) = (binding.device.as_str(), binding.slot);
        let luks_type = self.inspector().luks_type(device)?;
        if slot >= luks_type.keyslots() {
            return Err(ClevisError::InvalidBinding(format!(
                "{device}:{slot}: {luks_type} has no keyslot {slot}"
            )));
        }
        let metadata = self.inspector().classify(device, !self.dry_run)?;
        let policy = build_policy(self.host, &binding.servers, binding.threshold)?
            .ok_or_else(|| {
                ClevisError::InvalidBinding(format!("{device}:{slot}: no servers to bind to"))
            })?;
        let request = BindRequest {
            binding,
            metadata,
            policy,
        };

        if self.already_bound(&request) {
            return Ok(Action::Unchanged);
        }

        let bound = self.inspector().is_clevis_bound(&request.metadata, slot)?;
        if bound && !binding.overwrite {
            return Err(ClevisError::AlreadyBound {
                device: device.to_string(),
                slot,
            });
        }
        let occupied = self
            .inspector()
            .occupied_slots(&request.metadata)?
            .contains(&slot);
        if occupied && !bound {
            return Err(ClevisError::SlotInUse {
                device: device.to_string(),
                slot,
            });
        }
        if self.dry_run {
            return Ok(Action::WouldBind);
        }

        self.bind_slot(&request, bound)?;
        Ok(if bound { Action::Rebound } else { Action::Bound })
    }

    /// All of: the slot holds a blob, it decrypts, the secret unlocks the
    /// slot, its policy matches `request.policy` and none of its keys have
    /// been rotated away.
    fn already_bound(&self, request: &BindRequest) -> bool {
        let (device, slot) = (request.device(), request.slot());
        let Ok(blob) = request.metadata.read_blob(self.host, slot) else {
            return false;
        };
        let secret = match self.host.decrypt(&blob) {
            Ok(secret) => secret,
            Err(e) => {
                log::info!("{}:{} does not decrypt, rebinding: {}", device, slot, e);
                return false;
            }
        };
        if !self
            .inspector()
            .verify_passphrase(device, &Credential::Passphrase(secret), Some(slot))
        {
            log::info!("{}:{} binding does not unlock its slot", device, slot);
            return false;
        }
        let decoded = match decode_policy(&blob) {
            Ok(decoded) => decoded,
            Err(e) => {
                log::info!("{}:{} policy unreadable: {}", device, slot, e);
                return false;
            }
        };
        if decoded.pin() != request.policy.pin()
            || !configs_equivalent(&decoded.config, &request.policy.config)
        {
            log::info!("{}:{} bound with a different configuration", device, slot);
            return false;
        }
        if !decoded.keys.is_subset(&request.policy.keys) {
            log::info!("{}:{} bound to keys no longer advertised", device, slot);
            return false;
        }
        true
    }

    fn bind_slot(&self, request: &BindRequest, bound: bool) -> Result<()> {
        let (device, slot) = (request.device(), request.slot());
        let metadata = &request.metadata;
        let keyslots = self.keyslots();

        let resolved = self.resolve_credential(request.binding, metadata)?;
        let current: &Credential = match &resolved {
            Either::Left(supplied) => supplied,
            Either::Right(recovered) => recovered,
        };

        let key = keyslots.generate_key(metadata)?;
        let jwe = self.encrypt_verified(&request.policy, &key)?;
        let undo = self.plan_undo(request, current, bound)?;

        let rebind = match bound {
            true => Some(MetadataTransaction::begin(metadata, self.host, slot, true)?),
            false => None,
        };

        // The keyslot goes first: metadata must only reference a live slot.
        let change = match keyslots.set_passphrase(metadata, slot, current, &key) {
            Ok(change) => change,
            Err(e) if e.is_fatal() => return Err(e),
            Err(e) => {
                return Err(match rebind {
                    Some(transaction) => transaction.rollback(e),
                    None => e,
                })
            }
        };

        if let Err(e) = metadata.write_blob(self.host, slot, &jwe, true) {
            return Err(self.revert_keyslot(request, &key, undo, rebind, e));
        }
        if let Some(transaction) = rebind {
            transaction.commit();
        }
        log::info!(
            "{}:{} bound with {} policy, blob {}",
            device,
            slot,
            request.policy.pin(),
            jwe::blob_id(&jwe)
        );

        let discard = request.binding.password_temporary
            && resolved.is_left()
            && change != PassphraseChange::InPlace;
        if discard {
            log::info!("discarding temporary passphrase from {}", device);
            keyslots
                .discard(device, current)
                .map_err(|e| ClevisError::CredentialRetained {
                    device: device.to_string(),
                    source: Box::new(e),
                })?;
        }
        Ok(())
    }

    /// The supplied credential if it unlocks the device. Otherwise, when
    /// none was supplied or it was temporary, the first existing binding
    /// whose secret unlocks its own slot.
    fn resolve_credential<'b>(
        &self,
        binding: &'b Binding,
        metadata: &LuksMetadata,
    ) -> Result<Either<&'b Credential, Credential>> {
        let device = binding.device.as_str();
        let inspector = self.inspector();
        if let Some(supplied) = &binding.credential {
            if inspector.verify_passphrase(device, supplied, None) {
                return Ok(Either::Left(supplied));
            }
            if !binding.password_temporary {
                return Err(ClevisError::InvalidPassphrase(device.to_string()));
            }
            log::warn!(
                "temporary passphrase for {} does not unlock it, trying existing bindings",
                device
            );
        }

        for slot in inspector.bound_slots(metadata)? {
            let secret = metadata
                .read_blob(self.host, slot)
                .and_then(|blob| self.host.decrypt(&blob));
            match secret {
                Ok(secret) => {
                    let recovered = Credential::Passphrase(secret);
                    if inspector.verify_passphrase(device, &recovered, Some(slot)) {
                        log::info!("using passphrase recovered from {}:{}", device, slot);
                        return Ok(Either::Right(recovered));
                    }
                }
                Err(e) => log::debug!("{}:{} unusable for recovery: {}", device, slot, e),
            }
        }
        Err(ClevisError::NoValidCredential(device.to_string()))
    }

    /// Encrypt `key` to `policy` and check the blob decrypts back to it.
    fn encrypt_verified(&self, policy: &Policy, key: &Secret) -> Result<String> {
        let jwe = self.host.encrypt(policy.pin(), &policy.to_json()?, key)?;
        match self.host.decrypt(&jwe) {
            Ok(decrypted) if decrypted == *key => Ok(jwe),
            Ok(_) => Err(ClevisError::VerificationMismatch(format!(
                "{} blob {} does not decrypt to the generated key",
                policy.pin(),
                jwe::blob_id(&jwe)
            ))),
            Err(e) => Err(ClevisError::VerificationMismatch(format!(
                "{} blob {} does not decrypt: {}",
                policy.pin(),
                jwe::blob_id(&jwe),
                e
            ))),
        }
    }

    fn plan_undo(
        &self,
        request: &BindRequest,
        current: &Credential,
        bound: bool,
    ) -> Result<KeyslotUndo> {
        let (device, slot) = (request.device(), request.slot());
        let inspector = self.inspector();
        if !inspector.occupied_slots(&request.metadata)?.contains(&slot) {
            return Ok(KeyslotUndo::Kill);
        }
        if inspector.verify_passphrase(device, current, Some(slot)) {
            return Ok(KeyslotUndo::Restore(current.clone()));
        }
        if bound {
            let previous = request
                .metadata
                .read_blob(self.host, slot)
                .and_then(|blob| self.host.decrypt(&blob));
            match previous {
                Ok(secret) => return Ok(KeyslotUndo::Restore(Credential::Passphrase(secret))),
                Err(e) => log::warn!("previous secret of {}:{} unknown: {}", device, slot, e),
            }
        }
        Ok(KeyslotUndo::Unavailable)
    }

    /// Undo the keyslot change after the metadata write failed, then the
    /// metadata removal of a rebind.
    fn revert_keyslot(
        &self,
        request: &BindRequest,
        key: &Secret,
        undo: KeyslotUndo,
        rebind: Option<MetadataTransaction>,
        cause: ClevisError,
    ) -> ClevisError {
        let (device, slot) = (request.device(), request.slot());
        if cause.is_fatal() {
            return cause;
        }
        let keyslots = self.keyslots();
        let reverted = match &undo {
            KeyslotUndo::Kill => keyslots.kill(&request.metadata, slot, None),
            KeyslotUndo::Restore(previous) => {
                keyslots.restore_passphrase(&request.metadata, slot, key, previous)
            }
            KeyslotUndo::Unavailable => {
                return ClevisError::PartialFailure(format!(
                    "{cause}; previous passphrase of {device}:{slot} unknown, \
                     slot keeps the new key"
                ))
            }
        };
        match reverted {
            Ok(()) => match rebind {
                Some(transaction) => transaction.rollback(cause),
                None => cause,
            },
            Err(e) => ClevisError::PartialFailure(format!(
                "{cause}; reverting keyslot {device}:{slot} failed: {e}"
            )),
        }
    }

    fn unbind(&self, binding: &Binding) -> Result<Action> {
        let (device, slot) = (binding.device.as_str(), binding.slot);
        let inspector = self.inspector();
        let metadata = match inspector.classify(device, false) {
            Ok(metadata) => metadata,
            Err(e @ (ClevisError::NotLuks(_) | ClevisError::UnknownLuksType(_))) => {
                log::info!("nothing to unbind: {}", e);
                return Ok(Action::NotApplicable);
            }
            Err(e) => return Err(e),
        };
        if !inspector.is_clevis_bound(&metadata, slot)? {
            return Ok(Action::Unchanged);
        }
        if self.dry_run {
            return Ok(Action::WouldUnbind);
        }

        // Tokens are found by keyslot, so the metadata goes first.
        let context = format!("removing clevis metadata from {device}:{slot}");
        let transaction = MetadataTransaction::begin(&metadata, self.host, slot, true)
            .map_err(|e| ClevisError::fatal(context, e))?;
        if let Err(e) = self.keyslots().kill(&metadata, slot, None) {
            let e = transaction.rollback(e);
            let context = format!("killing keyslot {device}:{slot}");
            return Err(ClevisError::fatal(context, e));
        }
        transaction.commit();
        Ok(Action::Unbound)
    }
}
