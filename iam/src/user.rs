//! The user aggregate: write model and commands.
//!
//! Every command is a [`WriteCommand`] run through
//! [`Eventstore::execute`](warden_core::Eventstore::execute). Commands are
//! decided against the loaded aggregate sequence, so two racing writers on
//! the same user end in one success and one `ConcurrencyConflict`. Usernames
//! are claimed and released through the [`USERNAMES`] unique constraint in
//! the same transaction as the event that changes them.

use crate::events::{
    IamEvent, USER_AGGREGATE, USER_VERSION, USERNAMES, UserAdded, UserDeactivated,
    UserReactivated, UserRemoved, UsernameChanged, username_key,
};
use warden_core::{
    Aggregate, Command, Editor, EventstoreError, ObjectState, QueryReducer, SearchQuery,
    UniqueConstraint, WriteCommand, WriteModel, ensure_changed, ensure_exists, ensure_not_exists,
    expect_sequence_of,
};

/// Fold of one user's events.
#[derive(Clone, Debug)]
pub struct UserWriteModel {
    /// Identity and processed sequence.
    pub base: WriteModel<IamEvent>,
    /// Current login name.
    pub username: String,
    /// Current display name.
    pub display_name: String,
    /// Lifecycle state.
    pub state: ObjectState,
}

impl UserWriteModel {
    /// Empty model for `user_id`. An empty `resource_owner` matches any owner.
    #[must_use]
    pub fn new(user_id: &str, instance_id: &str, resource_owner: &str) -> Self {
        Self {
            base: WriteModel::new(user_id, instance_id, resource_owner),
            username: String::new(),
            display_name: String::new(),
            state: ObjectState::NotExists,
        }
    }

    /// Aggregate identity new events are appended to.
    #[must_use]
    pub fn aggregate(&self) -> Aggregate {
        Aggregate::new(
            USER_AGGREGATE,
            self.base.aggregate_id.clone(),
            self.base.instance_id.clone(),
            self.base.resource_owner.clone(),
            USER_VERSION,
        )
    }
}

impl QueryReducer for UserWriteModel {
    type Event = IamEvent;

    fn query(&self) -> SearchQuery {
        SearchQuery::new().filter(self.base.aggregate_filter(USER_AGGREGATE))
    }

    fn append_events(&mut self, events: Vec<warden_core::Envelope<IamEvent>>) {
        self.base.append_events(events);
    }

    fn reduce(&mut self) -> Result<(), EventstoreError> {
        for envelope in self.base.take_events() {
            match &envelope.event {
                IamEvent::UserAdded(e) => {
                    self.username.clone_from(&e.username);
                    self.display_name.clone_from(&e.display_name);
                    self.state = self.state.transition(ObjectState::Active);
                }
                IamEvent::UsernameChanged(e) => self.username.clone_from(&e.username),
                IamEvent::UserDeactivated(_) => {
                    self.state = self.state.transition(ObjectState::Inactive);
                }
                IamEvent::UserReactivated(_) => {
                    self.state = self.state.transition(ObjectState::Active);
                }
                IamEvent::UserRemoved(_) => {
                    self.state = self.state.transition(ObjectState::Removed);
                }
            }
            self.base.processed(&envelope);
        }
        Ok(())
    }
}

fn require(value: &str, field: &str) -> Result<(), EventstoreError> {
    if value.trim().is_empty() {
        return Err(EventstoreError::InvalidArgument(format!("{field} is required")));
    }
    Ok(())
}

fn username_constraint(username: &str) -> UniqueConstraint {
    UniqueConstraint::add(USERNAMES, username_key(username), "username already taken")
}

/// Create a user and claim its username.
#[derive(Clone, Debug)]
pub struct AddUser {
    /// Tenant instance.
    pub instance_id: String,
    /// Owning organisation.
    pub resource_owner: String,
    /// New user id.
    pub user_id: String,
    /// Login name.
    pub username: String,
    /// Name shown in UIs; defaults to the username.
    pub display_name: String,
    /// Caller identity recorded on the event.
    pub editor: Editor,
}

impl AddUser {
    /// Create a user in `resource_owner` of `instance_id`.
    #[must_use]
    pub fn new(instance_id: &str, resource_owner: &str, user_id: &str, username: &str) -> Self {
        Self {
            instance_id: instance_id.to_string(),
            resource_owner: resource_owner.to_string(),
            user_id: user_id.to_string(),
            username: username.to_string(),
            display_name: username.to_string(),
            editor: Editor::default(),
        }
    }

    /// Set the display name.
    #[must_use]
    pub fn with_display_name(mut self, display_name: &str) -> Self {
        self.display_name = display_name.to_string();
        self
    }

    /// Record `editor` on the event.
    #[must_use]
    pub fn with_editor(mut self, editor: Editor) -> Self {
        self.editor = editor;
        self
    }
}

impl WriteCommand<IamEvent> for AddUser {
    type Model = UserWriteModel;

    fn validate(&self) -> Result<(), EventstoreError> {
        require(&self.instance_id, "instance id")?;
        require(&self.resource_owner, "resource owner")?;
        require(&self.user_id, "user id")?;
        require(&self.username, "username")
    }

    fn write_model(&self) -> UserWriteModel {
        // User ids are unique across owners.
        UserWriteModel::new(&self.user_id, &self.instance_id, "")
    }

    fn check(&self, model: &UserWriteModel) -> Result<(), EventstoreError> {
        ensure_not_exists(model.state, "user")
    }

    fn decide(&self, model: &UserWriteModel) -> Result<Vec<Command>, EventstoreError> {
        let aggregate = Aggregate::new(
            USER_AGGREGATE,
            self.user_id.as_str(),
            self.instance_id.as_str(),
            self.resource_owner.as_str(),
            USER_VERSION,
        );
        let event = UserAdded {
            username: self.username.trim().to_string(),
            display_name: self.display_name.clone(),
        };
        let command = Command::new(aggregate, self.editor.clone(), &event)?
            .with_unique_constraint(username_constraint(&self.username));
        Ok(expect_sequence_of(&model.base, vec![command]))
    }
}

/// Rename a user, moving the username claim.
#[derive(Clone, Debug)]
pub struct ChangeUsername {
    /// Tenant instance.
    pub instance_id: String,
    /// User to rename.
    pub user_id: String,
    /// New login name.
    pub username: String,
    /// Caller identity recorded on the event.
    pub editor: Editor,
}

impl WriteCommand<IamEvent> for ChangeUsername {
    type Model = UserWriteModel;

    fn validate(&self) -> Result<(), EventstoreError> {
        require(&self.instance_id, "instance id")?;
        require(&self.user_id, "user id")?;
        require(&self.username, "username")
    }

    fn write_model(&self) -> UserWriteModel {
        UserWriteModel::new(&self.user_id, &self.instance_id, "")
    }

    fn check(&self, model: &UserWriteModel) -> Result<(), EventstoreError> {
        ensure_exists(model.state, "user")?;
        ensure_changed(model.username.as_str(), self.username.trim(), "username")
    }

    fn decide(&self, model: &UserWriteModel) -> Result<Vec<Command>, EventstoreError> {
        let event = UsernameChanged {
            old_username: model.username.clone(),
            username: self.username.trim().to_string(),
        };
        let mut command = Command::new(model.aggregate(), self.editor.clone(), &event)?;
        // A case-only rename keeps the claim.
        if username_key(&model.username) != username_key(&self.username) {
            command = command
                .with_unique_constraint(UniqueConstraint::remove(
                    USERNAMES,
                    username_key(&model.username),
                ))
                .with_unique_constraint(username_constraint(&self.username));
        }
        Ok(expect_sequence_of(&model.base, vec![command]))
    }
}

/// Lock a user out.
#[derive(Clone, Debug)]
pub struct DeactivateUser {
    /// Tenant instance.
    pub instance_id: String,
    /// User to deactivate.
    pub user_id: String,
    /// Caller identity recorded on the event.
    pub editor: Editor,
}

impl WriteCommand<IamEvent> for DeactivateUser {
    type Model = UserWriteModel;

    fn validate(&self) -> Result<(), EventstoreError> {
        require(&self.instance_id, "instance id")?;
        require(&self.user_id, "user id")
    }

    fn write_model(&self) -> UserWriteModel {
        UserWriteModel::new(&self.user_id, &self.instance_id, "")
    }

    fn check(&self, model: &UserWriteModel) -> Result<(), EventstoreError> {
        ensure_exists(model.state, "user")?;
        if model.state != ObjectState::Active {
            return Err(EventstoreError::PreconditionFailed(
                "user is not active".to_string(),
            ));
        }
        Ok(())
    }

    fn decide(&self, model: &UserWriteModel) -> Result<Vec<Command>, EventstoreError> {
        let command = Command::new(model.aggregate(), self.editor.clone(), &UserDeactivated)?;
        Ok(expect_sequence_of(&model.base, vec![command]))
    }
}

/// Let a deactivated user back in.
#[derive(Clone, Debug)]
pub struct ReactivateUser {
    /// Tenant instance.
    pub instance_id: String,
    /// User to reactivate.
    pub user_id: String,
    /// Caller identity recorded on the event.
    pub editor: Editor,
}

impl WriteCommand<IamEvent> for ReactivateUser {
    type Model = UserWriteModel;

    fn validate(&self) -> Result<(), EventstoreError> {
        require(&self.instance_id, "instance id")?;
        require(&self.user_id, "user id")
    }

    fn write_model(&self) -> UserWriteModel {
        UserWriteModel::new(&self.user_id, &self.instance_id, "")
    }

    fn check(&self, model: &UserWriteModel) -> Result<(), EventstoreError> {
        ensure_exists(model.state, "user")?;
        if model.state != ObjectState::Inactive {
            return Err(EventstoreError::PreconditionFailed(
                "user is not inactive".to_string(),
            ));
        }
        Ok(())
    }

    fn decide(&self, model: &UserWriteModel) -> Result<Vec<Command>, EventstoreError> {
        let command = Command::new(model.aggregate(), self.editor.clone(), &UserReactivated)?;
        Ok(expect_sequence_of(&model.base, vec![command]))
    }
}

/// Remove a user and release its username.
#[derive(Clone, Debug)]
pub struct RemoveUser {
    /// Tenant instance.
    pub instance_id: String,
    /// User to remove.
    pub user_id: String,
    /// Caller identity recorded on the event.
    pub editor: Editor,
}

impl WriteCommand<IamEvent> for RemoveUser {
    type Model = UserWriteModel;

    fn validate(&self) -> Result<(), EventstoreError> {
        require(&self.instance_id, "instance id")?;
        require(&self.user_id, "user id")
    }

    fn write_model(&self) -> UserWriteModel {
        UserWriteModel::new(&self.user_id, &self.instance_id, "")
    }

    fn check(&self, model: &UserWriteModel) -> Result<(), EventstoreError> {
        ensure_exists(model.state, "user")
    }

    fn decide(&self, model: &UserWriteModel) -> Result<Vec<Command>, EventstoreError> {
        let event = UserRemoved {
            username: model.username.clone(),
        };
        let command = Command::new(model.aggregate(), self.editor.clone(), &event)?
            .with_unique_constraint(UniqueConstraint::remove(
                USERNAMES,
                username_key(&model.username),
            ));
        Ok(expect_sequence_of(&model.base, vec![command]))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)] // Test code can use unwrap/expect
mod tests {
    use super::*;
    use warden_core::{Envelope, EventType, Utc};

    fn envelope(aggregate_sequence: u64, event: IamEvent) -> Envelope<IamEvent> {
        Envelope {
            aggregate: Aggregate::new(USER_AGGREGATE, "u-1", "inst", "org", USER_VERSION),
            event_type: EventType::new("user.test"),
            sequence: aggregate_sequence,
            aggregate_sequence,
            created_at: Utc::now(),
            editor: Editor::default(),
            event,
        }
    }

    fn added(username: &str) -> IamEvent {
        IamEvent::UserAdded(UserAdded {
            username: username.to_string(),
            display_name: username.to_string(),
        })
    }

    #[test]
    fn fold_tracks_state_and_sequence() {
        let mut model = UserWriteModel::new("u-1", "inst", "");
        model.append_events(vec![
            envelope(1, added("alice")),
            envelope(
                2,
                IamEvent::UsernameChanged(UsernameChanged {
                    old_username: "alice".to_string(),
                    username: "alicia".to_string(),
                }),
            ),
            envelope(3, IamEvent::UserDeactivated(UserDeactivated)),
        ]);
        model.reduce().unwrap();

        assert_eq!(model.username, "alicia");
        assert_eq!(model.state, ObjectState::Inactive);
        assert_eq!(model.base.processed_sequence, 3);
        assert_eq!(model.base.resource_owner.as_str(), "org");
    }

    #[test]
    fn removed_user_stays_removed() {
        let mut model = UserWriteModel::new("u-1", "inst", "");
        model.append_events(vec![
            envelope(1, added("alice")),
            envelope(
                2,
                IamEvent::UserRemoved(UserRemoved {
                    username: "alice".to_string(),
                }),
            ),
            envelope(3, IamEvent::UserReactivated(UserReactivated)),
        ]);
        model.reduce().unwrap();
        assert_eq!(model.state, ObjectState::Removed);
    }

    #[test]
    fn add_user_rejects_blank_username() {
        let command = AddUser::new("inst", "org", "u-1", "  ");
        assert!(matches!(
            command.validate(),
            Err(EventstoreError::InvalidArgument(_))
        ));
    }

    #[test]
    fn add_user_claims_normalised_username() {
        let command = AddUser::new("inst", "org", "u-1", "Alice");
        let model = command.write_model();
        let decided = command.decide(&model).unwrap();

        assert_eq!(decided.len(), 1);
        assert_eq!(decided[0].expected_sequence, Some(0));
        assert_eq!(decided[0].unique_constraints, vec![username_constraint("alice")]);
    }
}
