//! # Keyring
//!
//! Holds the epoch key material of one company: for every key epoch, an
//! envelope carrying the data key wrapped under the owner's master key plus
//! one view share per granted principal. The keyring never stores a data
//! key in the clear; callers unwrap on demand and let the key drop.
//!
//! The keyring and the [access ledger](crate::ledger) move together: every
//! grant, revocation, and rotation both mutates envelope state and produces
//! a signed ledger entry for replication. Envelope contents are safe to
//! replicate through the untrusted relay, they are wrapped keys.

pub mod rotation;

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::crypto::{DataKey, MasterKey, PublicKey, SecretKey, ViewShare, WrapError, WrappedKey};
use crate::ledger::{AccessLedger, LedgerEntry, LedgerError, LedgerEvent, Scope};
use crate::record::Epoch;

/// Errors that can occur during keyring operations
#[derive(Debug, thiserror::Error)]
pub enum KeyringError {
    #[error("keyring error: {0}")]
    Default(#[from] anyhow::Error),
    /// No envelope exists for the requested epoch on this device
    #[error("no key envelope for epoch {0}")]
    EpochKeyUnavailable(Epoch),
    /// The held credentials cannot unwrap this epoch's data key
    #[error("held credentials cannot unwrap epoch {0}")]
    UnauthorizedKey(Epoch),
    /// Operation requires the master key and this device is view-only
    #[error("operation requires owner credentials")]
    OwnerRequired,
    /// The requested grant scope exceeds what the granter holds
    #[error("scope too broad: {0}")]
    ScopeTooBroad(String),
    #[error(transparent)]
    Wrap(#[from] WrapError),
    #[error(transparent)]
    Ledger(#[from] LedgerError),
}

/// Wrapped key material for one epoch
///
/// `wrapped_master` is the epoch data key under the owner master key
/// (AES-KW). `view_shares` maps principal hex keys to ECDH-wrapped copies
/// of the same data key. A superseded envelope stays forever: old
/// ciphertext still references its epoch until rotation re-encrypts it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeyEnvelope {
    pub epoch: Epoch,
    pub wrapped_master: WrappedKey,
    pub view_shares: BTreeMap<String, ViewShare>,
    pub created_at: DateTime<Utc>,
    pub superseded_by: Option<Epoch>,
}

impl KeyEnvelope {
    /// Merge a replicated copy of the same envelope
    ///
    /// View shares union (a share for a principal is immutable once
    /// minted) and supersession is monotone: once set it never clears,
    /// and concurrent supersessions keep the smaller successor.
    pub fn merge(&mut self, other: &KeyEnvelope) {
        for (principal, share) in &other.view_shares {
            self.view_shares
                .entry(principal.clone())
                .or_insert_with(|| share.clone());
        }
        self.superseded_by = match (self.superseded_by, other.superseded_by) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };
    }
}

/// The portable, relay-safe projection of a keyring
///
/// Everything in here is either public or wrapped, so the bundle can pass
/// through the untrusted relay unmodified.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct KeyringBundle {
    pub envelopes: BTreeMap<Epoch, KeyEnvelope>,
}

/// Per-company key manager
///
/// Owner devices hold the master key and can rotate, grant, and revoke.
/// View-only devices hold just their principal keypair and recover epoch
/// keys from their view shares.
pub struct Keyring {
    company_id: Uuid,
    /// This device's principal keypair
    device: SecretKey,
    /// Present on owner devices only
    master: Option<MasterKey>,
    envelopes: BTreeMap<Epoch, KeyEnvelope>,
    ledger: AccessLedger,
}

impl Keyring {
    /// Create a company keyring: genesis epoch plus the self-signed
    /// genesis grant
    ///
    /// Returns the keyring and the ledger entry to replicate.
    pub fn create(
        company_id: Uuid,
        device: SecretKey,
        master: MasterKey,
        now: DateTime<Utc>,
    ) -> Result<(Self, LedgerEntry), KeyringError> {
        let data_key = DataKey::generate();
        let envelope = KeyEnvelope {
            epoch: Epoch::GENESIS,
            wrapped_master: WrappedKey::wrap(&data_key, &master)?,
            view_shares: BTreeMap::new(),
            created_at: now,
            superseded_by: None,
        };

        let entry = LedgerEntry::sign(
            company_id,
            &device,
            LedgerEvent::Granted {
                principal: device.public(),
                scope: Scope::Full,
                epoch_from: Epoch::GENESIS,
            },
            now,
        )?;

        let mut ledger = AccessLedger::new();
        ledger.insert(entry.clone())?;

        let mut envelopes = BTreeMap::new();
        envelopes.insert(Epoch::GENESIS, envelope);

        Ok((
            Self {
                company_id,
                device,
                master: Some(master),
                envelopes,
                ledger,
            },
            entry,
        ))
    }

    /// Open a keyring on another owner device from replicated state
    ///
    /// The master key comes from the company passphrase; envelopes and the
    /// ledger arrive (possibly empty) through replication.
    pub fn open_owner(
        company_id: Uuid,
        device: SecretKey,
        master: MasterKey,
        bundle: KeyringBundle,
        ledger: AccessLedger,
    ) -> Self {
        Self {
            company_id,
            device,
            master: Some(master),
            envelopes: bundle.envelopes,
            ledger,
        }
    }

    /// Open a keyring on a view-only device from replicated state
    pub fn open_view(
        company_id: Uuid,
        device: SecretKey,
        bundle: KeyringBundle,
        ledger: AccessLedger,
    ) -> Self {
        Self {
            company_id,
            device,
            master: None,
            envelopes: bundle.envelopes,
            ledger,
        }
    }

    pub fn company_id(&self) -> Uuid {
        self.company_id
    }

    pub fn device_key(&self) -> PublicKey {
        self.device.public()
    }

    pub fn is_owner(&self) -> bool {
        self.master.is_some()
    }

    pub fn ledger(&self) -> &AccessLedger {
        &self.ledger
    }

    /// Ingest a replicated ledger entry; returns true if unseen
    pub fn merge_entry(&mut self, entry: LedgerEntry) -> Result<bool, LedgerError> {
        self.ledger.insert(entry)
    }

    /// Ingest replicated envelope state
    pub fn merge_bundle(&mut self, bundle: &KeyringBundle) {
        for (epoch, envelope) in &bundle.envelopes {
            match self.envelopes.get_mut(epoch) {
                Some(local) => local.merge(envelope),
                None => {
                    self.envelopes.insert(*epoch, envelope.clone());
                }
            }
        }
    }

    /// Snapshot the relay-safe projection for replication
    pub fn bundle(&self) -> KeyringBundle {
        KeyringBundle {
            envelopes: self.envelopes.clone(),
        }
    }

    /// The epoch new writes encrypt at
    ///
    /// This is a pure query: the greatest epoch whose envelope has not been
    /// superseded. Rotation changes it by superseding the old envelope, not
    /// by mutating a counter, so replicas converge on it from state alone.
    pub fn current_epoch(&self) -> Epoch {
        self.envelopes
            .values()
            .filter(|e| e.superseded_by.is_none())
            .map(|e| e.epoch)
            .max()
            .unwrap_or(Epoch::GENESIS)
    }

    /// Unwrap the data key for an epoch using whatever credentials this
    /// device holds
    pub fn data_key(&self, epoch: Epoch) -> Result<DataKey, KeyringError> {
        let envelope = self
            .envelopes
            .get(&epoch)
            .ok_or(KeyringError::EpochKeyUnavailable(epoch))?;

        if let Some(master) = &self.master {
            return match envelope.wrapped_master.unwrap(master) {
                Ok(key) => Ok(key),
                Err(WrapError::UnauthorizedKey) => Err(KeyringError::UnauthorizedKey(epoch)),
                Err(e) => Err(e.into()),
            };
        }

        let share = envelope
            .view_shares
            .get(&self.device.public().to_hex())
            .ok_or(KeyringError::UnauthorizedKey(epoch))?;
        share
            .recover(&self.device)
            .map_err(|_| KeyringError::UnauthorizedKey(epoch))
    }

    /// Mint the next key epoch
    ///
    /// The new data key is wrapped for the owner and for every principal
    /// holding an active grant; the previous envelope is marked superseded.
    /// Re-encrypting existing ciphertext is the separate, resumable job in
    /// [`rotation`].
    pub fn rotate(&mut self, now: DateTime<Utc>) -> Result<(Epoch, LedgerEntry), KeyringError> {
        let master = self.master.as_ref().ok_or(KeyringError::OwnerRequired)?;

        let previous = self.current_epoch();
        let next = previous.next();
        let data_key = DataKey::generate();

        let mut view_shares = BTreeMap::new();
        let state = self.ledger.replay();
        for grant in state.grants.iter().filter(|g| g.revoked_at.is_none()) {
            if grant.principal == self.device.public() {
                continue;
            }
            view_shares.insert(
                grant.principal.to_hex(),
                ViewShare::new(&data_key, &grant.principal)?,
            );
        }

        let envelope = KeyEnvelope {
            epoch: next,
            wrapped_master: WrappedKey::wrap(&data_key, master)?,
            view_shares,
            created_at: now,
            superseded_by: None,
        };

        if let Some(prev) = self.envelopes.get_mut(&previous) {
            prev.superseded_by = Some(next);
        }
        self.envelopes.insert(next, envelope);

        let entry = LedgerEntry::sign(
            self.company_id,
            &self.device,
            LedgerEvent::Rotated { new_epoch: next },
            now,
        )?;
        self.ledger.insert(entry.clone())?;

        tracing::info!(company = %self.company_id, epoch = %next, "rotated key epoch");
        Ok((next, entry))
    }

    /// Grant a principal decrypt access from the current epoch onward
    ///
    /// The principal receives a view share for the current envelope; future
    /// rotations keep minting shares while the grant stays active.
    pub fn grant_view(
        &mut self,
        principal: PublicKey,
        scope: Scope,
        now: DateTime<Utc>,
    ) -> Result<LedgerEntry, KeyringError> {
        if self.master.is_none() {
            // A view-only device holds a narrower scope than any grant it
            // could issue.
            return Err(KeyringError::ScopeTooBroad(
                "view-only devices cannot issue grants".to_string(),
            ));
        }

        let epoch = self.current_epoch();
        let data_key = self.data_key(epoch)?;
        let share = ViewShare::new(&data_key, &principal)?;
        if let Some(envelope) = self.envelopes.get_mut(&epoch) {
            envelope.view_shares.insert(principal.to_hex(), share);
        }

        let entry = LedgerEntry::sign(
            self.company_id,
            &self.device,
            LedgerEvent::Granted {
                principal,
                scope,
                epoch_from: epoch,
            },
            now,
        )?;
        self.ledger.insert(entry.clone())?;

        tracing::info!(company = %self.company_id, %principal, %epoch, "granted view key");
        Ok(entry)
    }

    /// Revoke a principal's access
    ///
    /// Full revocation also rotates: the revoked principal keeps whatever
    /// key material it already saw (that cannot be clawed back), but every
    /// epoch minted afterwards excludes it. Partial revocation ends the
    /// principal's scoped grants without rotating.
    pub fn revoke(
        &mut self,
        principal: PublicKey,
        full: bool,
        now: DateTime<Utc>,
    ) -> Result<Vec<LedgerEntry>, KeyringError> {
        if self.master.is_none() {
            return Err(KeyringError::OwnerRequired);
        }

        let entry = LedgerEntry::sign(
            self.company_id,
            &self.device,
            LedgerEvent::Revoked { principal, full },
            now,
        )?;
        self.ledger.insert(entry.clone())?;
        let mut entries = vec![entry];

        if full {
            let (_, rotate_entry) = self.rotate(now)?;
            entries.push(rotate_entry);
        }

        tracing::info!(company = %self.company_id, %principal, full, "revoked access");
        Ok(entries)
    }
}
