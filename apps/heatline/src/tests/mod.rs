mod progress_behavior;
